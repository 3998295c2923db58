//! Catalog file: export and import sequences as pretty JSON.
//! Human-readable and diff-friendly, so campaigns can live in version control.

use std::path::Path;

use chrono::Utc;
use notarydrip_core::error::{DripError, Result};
use serde::{Deserialize, Serialize};

use crate::catalog::validate_sequence;
use crate::model::Sequence;
use crate::persistence::SequenceDb;

const FORMAT_VERSION: u32 = 1;

/// On-disk catalog document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default = "default_version")]
    pub version: u32,
    pub exported_at: chrono::DateTime<Utc>,
    pub sequences: Vec<Sequence>,
}

fn default_version() -> u32 {
    FORMAT_VERSION
}

/// What an import changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub created: usize,
    pub updated: usize,
    pub steps_created: usize,
    pub steps_updated: usize,
}

/// Write every sequence to `path`.
pub fn export_catalog(db: &SequenceDb, path: &Path) -> Result<usize> {
    let file = CatalogFile {
        version: FORMAT_VERSION,
        exported_at: Utc::now(),
        sequences: db.list_sequences()?,
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(&file)?;
    std::fs::write(path, json)?;
    tracing::info!("💾 Exported {} sequences to {}", file.sequences.len(), path.display());
    Ok(file.sequences.len())
}

/// Load sequences from `path`. Every sequence is validated before anything is
/// written. Existing ids are updated in place (steps matched by id), so
/// pending sends keep pointing at the same steps.
pub fn import_catalog(db: &SequenceDb, path: &Path) -> Result<ImportReport> {
    let json = std::fs::read_to_string(path)?;
    let file: CatalogFile = serde_json::from_str(&json)?;
    if file.version != FORMAT_VERSION {
        return Err(DripError::Config(format!(
            "Unsupported catalog version {} (expected {FORMAT_VERSION})",
            file.version
        )));
    }
    for seq in &file.sequences {
        validate_sequence(seq)?;
        if seq.steps.iter().any(|s| s.sequence_id != seq.id) {
            return Err(DripError::Config(format!(
                "Sequence '{}' contains steps belonging to another sequence",
                seq.id
            )));
        }
    }

    let mut report = ImportReport::default();
    for seq in &file.sequences {
        match db.get_sequence(&seq.id)? {
            None => {
                db.insert_sequence(seq)?;
                report.created += 1;
                report.steps_created += seq.steps.len();
            }
            Some(existing) => {
                let mut updated = seq.clone();
                updated.updated_at = Utc::now();
                db.update_sequence(&updated)?;
                for step in &seq.steps {
                    if existing.steps.iter().any(|s| s.id == step.id) {
                        db.update_step(step)?;
                        report.steps_updated += 1;
                    } else {
                        db.insert_step(step)?;
                        report.steps_created += 1;
                    }
                }
                report.updated += 1;
            }
        }
    }
    tracing::info!(
        "📂 Imported {} from {}: {} created, {} updated",
        file.sequences.len(),
        path.display(),
        report.created,
        report.updated
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::model::{Delay, NewSequence, NewStep};
    use notarydrip_core::error::ValidationError;
    use notarydrip_core::funnel::StatusGate;
    use notarydrip_core::types::{Channel, TriggerEvent};
    use std::sync::Arc;

    fn temp_file(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("notarydrip-store-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn seed(catalog: &Catalog) -> Sequence {
        catalog
            .create_sequence(NewSequence {
                name: "Abandoned cart".into(),
                channel: Channel::Sms,
                trigger_event: TriggerEvent::CartAbandoned,
                required_status: None,
                status_gate: StatusGate::Exact,
                active: true,
                steps: vec![NewStep {
                    order_index: 1,
                    delay: Delay::hours(2),
                    window: None,
                    channel: None,
                    template_key: "cart_sms".into(),
                    subject: None,
                    body: "Finish your request: {{form_link}}".into(),
                    active: true,
                }],
            })
            .unwrap()
    }

    #[test]
    fn test_export_then_import_into_empty_db() {
        let source = Arc::new(SequenceDb::open_in_memory().unwrap());
        let seq = seed(&Catalog::new(source.clone()));
        let path = temp_file("catalog.json");
        assert_eq!(export_catalog(&source, &path).unwrap(), 1);

        let target = SequenceDb::open_in_memory().unwrap();
        let report = import_catalog(&target, &path).unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.steps_created, 1);
        let loaded = target.get_sequence(&seq.id).unwrap().unwrap();
        assert_eq!(loaded.steps[0].id, seq.steps[0].id);
        assert_eq!(loaded.channel, Channel::Sms);

        // Importing again updates in place.
        let again = import_catalog(&target, &path).unwrap();
        assert_eq!(again.updated, 1);
        assert_eq!(again.steps_updated, 1);
    }

    #[test]
    fn test_invalid_file_writes_nothing() {
        let source = Arc::new(SequenceDb::open_in_memory().unwrap());
        seed(&Catalog::new(source.clone()));
        let path = temp_file("bad.json");
        export_catalog(&source, &path).unwrap();

        let mut file: CatalogFile =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        file.sequences[0].steps[0].body = "".into();
        std::fs::write(&path, serde_json::to_string(&file).unwrap()).unwrap();

        let target = SequenceDb::open_in_memory().unwrap();
        assert!(matches!(import_catalog(&target, &path), Err(DripError::Validation(_))));
        assert!(target.list_sequences().unwrap().is_empty());
    }

    #[test]
    fn test_import_rejects_huge_delay() {
        let source = Arc::new(SequenceDb::open_in_memory().unwrap());
        seed(&Catalog::new(source.clone()));
        let path = temp_file("huge.json");
        export_catalog(&source, &path).unwrap();

        let mut file: CatalogFile =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        file.sequences[0].steps[0].delay = Delay::days(1_000_000_000_000);
        std::fs::write(&path, serde_json::to_string(&file).unwrap()).unwrap();

        let target = SequenceDb::open_in_memory().unwrap();
        assert!(matches!(
            import_catalog(&target, &path),
            Err(DripError::Validation(ValidationError::DelayTooLarge { .. }))
        ));
        assert!(target.list_sequences().unwrap().is_empty());
    }
}
