//! Built-in fixture resolver and pipeline for local runs.
//!
//! Production deployments implement [`evid_pipeline::TermResolver`] and
//! [`evid_pipeline::EvidencePipeline`] against the real MeSH and
//! literature services; the CLI wires these fixtures instead so the
//! whole refresh path can be exercised offline.

use evid_pipeline::{
    EvidencePipeline, FixtureEvidencePipeline, PipelineOutput, StaticTermResolver, TermResolver,
};
use evid_types::{CandidateClaim, Classification, ClaimEvidence, Confidence, EvidenceBundle};
use std::sync::Arc;

struct DemoEntry {
    condition_variants: &'static [&'static str],
    canonical_label: &'static str,
    mesh_terms: &'static [&'static str],
    claims: &'static [DemoClaim],
}

struct DemoClaim {
    classification: Classification,
    confidence: Confidence,
    summary: &'static str,
    drugs: &'static [&'static str],
    drug_classes: &'static [&'static str],
    pmid: &'static str,
}

const DEMO_ENTRIES: &[DemoEntry] = &[
    DemoEntry {
        condition_variants: &["malignant hyperthermia", "mh"],
        canonical_label: "Malignant Hyperthermia",
        mesh_terms: &["Malignant Hyperthermia"],
        claims: &[
            DemoClaim {
                classification: Classification::Risk,
                confidence: Confidence::High,
                summary: "Volatile anesthetics can trigger a hypermetabolic crisis.",
                drugs: &["Sevoflurane", "Isoflurane"],
                drug_classes: &["Volatile anesthetics"],
                pmid: "29300000",
            },
            DemoClaim {
                classification: Classification::Safety,
                confidence: Confidence::High,
                summary: "Total intravenous anesthesia with propofol is considered safe.",
                drugs: &["Propofol"],
                drug_classes: &[],
                pmid: "29300001",
            },
        ],
    },
    DemoEntry {
        condition_variants: &["long qt syndrome", "lqts"],
        canonical_label: "Long QT Syndrome",
        mesh_terms: &["Long QT Syndrome"],
        claims: &[DemoClaim {
            classification: Classification::Risk,
            confidence: Confidence::Medium,
            summary: "QT-prolonging antiemetics warrant ECG monitoring.",
            drugs: &["Ondansetron"],
            drug_classes: &["Serotonin antagonists"],
            pmid: "29300002",
        }],
    },
    DemoEntry {
        condition_variants: &["g6pd deficiency", "glucose-6-phosphate dehydrogenase deficiency"],
        canonical_label: "G6PD Deficiency",
        mesh_terms: &["Glucosephosphate Dehydrogenase Deficiency"],
        claims: &[DemoClaim {
            classification: Classification::Risk,
            confidence: Confidence::High,
            summary: "Oxidant drugs can precipitate acute hemolysis.",
            drugs: &["Rasburicase", "Primaquine"],
            drug_classes: &["Oxidant agents"],
            pmid: "29300003",
        }],
    },
];

pub fn resolver() -> Arc<dyn TermResolver> {
    let mut resolver = StaticTermResolver::new();
    for entry in DEMO_ENTRIES {
        for condition in entry.condition_variants {
            resolver = resolver.with_entry(condition, entry.canonical_label, entry.mesh_terms);
        }
    }
    Arc::new(resolver)
}

pub fn pipeline() -> Arc<dyn EvidencePipeline> {
    let mut pipeline = FixtureEvidencePipeline::new();
    for entry in DEMO_ENTRIES {
        let key = evid_canonical_key(entry);
        pipeline = pipeline.script(&key, vec![Ok(PipelineOutput::Bundle(bundle_for(entry)))]);
    }
    Arc::new(pipeline)
}

fn evid_canonical_key(entry: &DemoEntry) -> evid_canonical::CanonicalKey {
    let terms: Vec<String> = entry.mesh_terms.iter().map(|term| term.to_string()).collect();
    evid_canonical::CanonicalKey::from_mesh_terms(&terms)
}

fn bundle_for(entry: &DemoEntry) -> EvidenceBundle {
    let claims = entry
        .claims
        .iter()
        .enumerate()
        .map(|(index, claim)| CandidateClaim {
            claim_id: format!("demo-{}-{index}", entry.canonical_label.to_lowercase()),
            classification: claim.classification,
            confidence: claim.confidence,
            summary: claim.summary.to_string(),
            drugs: claim.drugs.iter().map(|drug| drug.to_string()).collect(),
            drug_classes: claim
                .drug_classes
                .iter()
                .map(|class| class.to_string())
                .collect(),
            source_claim_ids: Vec::new(),
            evidence: vec![ClaimEvidence {
                snippet_id: format!("demo-snippet-{}", claim.pmid),
                pmid: claim.pmid.to_string(),
                article_title: None,
                citation_url: None,
                key_points: Vec::new(),
                notes: None,
            }],
        })
        .collect();
    EvidenceBundle { claims }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn demo_resolver_and_pipeline_cover_the_same_keys() {
        let resolver = resolver();
        let pipeline = pipeline();

        for entry in DEMO_ENTRIES {
            let resolution = resolver
                .resolve_terms(entry.condition_variants[0])
                .await
                .expect("demo condition resolves");
            let key = resolution.canonical_key();

            let (sender, _receiver) = tokio::sync::mpsc::unbounded_channel();
            let output = pipeline
                .build_bundle(&key, &resolution.mesh_terms, sender)
                .await
                .expect("demo pipeline runs");
            match output {
                PipelineOutput::Bundle(bundle) => assert!(!bundle.is_empty()),
                other => panic!("expected a bundle, got {other:?}"),
            }
        }
    }
}
