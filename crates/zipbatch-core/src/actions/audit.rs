use async_trait::async_trait;

use crate::{
    classify::ClassificationTable,
    discovery::Item,
    outcome::Outcome,
    pipeline::{ActionOutput, ItemAction, ItemError},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AuditOutcome {
    /// Sidecar parsed and carries a stored secret.
    Complete,
    NoSidecar,
    /// Sidecar present but unparseable or missing the secret.
    BadSidecar,
    Failed,
}

impl Outcome for AuditOutcome {
    fn tag(&self) -> &'static str {
        match self {
            AuditOutcome::Complete => "complete",
            AuditOutcome::NoSidecar => "no_sidecar",
            AuditOutcome::BadSidecar => "bad_sidecar",
            AuditOutcome::Failed => "failed",
        }
    }

    fn all() -> &'static [Self] {
        &[
            AuditOutcome::Complete,
            AuditOutcome::NoSidecar,
            AuditOutcome::BadSidecar,
            AuditOutcome::Failed,
        ]
    }

    fn failed() -> Self {
        AuditOutcome::Failed
    }
}

const CODE_OK: &str = "OK";
const CODE_NO_SIDECAR: &str = "NO_SIDECAR";
const CODE_UNPARSEABLE: &str = "UNPARSEABLE_SIDECAR";
const CODE_NO_SECRET: &str = "NO_SECRET";

/// Checks that each item is a non-empty file with a usable sidecar.
#[derive(Clone, Debug)]
pub struct SidecarAudit {
    table: ClassificationTable<AuditOutcome>,
}

impl Default for SidecarAudit {
    fn default() -> Self {
        Self {
            table: [
                (CODE_OK, AuditOutcome::Complete),
                (CODE_NO_SIDECAR, AuditOutcome::NoSidecar),
                (CODE_UNPARSEABLE, AuditOutcome::BadSidecar),
                (CODE_NO_SECRET, AuditOutcome::BadSidecar),
            ]
            .into_iter()
            .collect(),
        }
    }
}

impl SidecarAudit {
    pub fn new() -> Self {
        Self::default()
    }

    fn code_for(item: &Item) -> &'static str {
        if item.sidecar.is_none() {
            CODE_NO_SIDECAR
        } else if item.has_broken_sidecar() {
            CODE_UNPARSEABLE
        } else if item.secret().is_none() {
            CODE_NO_SECRET
        } else {
            CODE_OK
        }
    }
}

#[async_trait]
impl ItemAction<AuditOutcome> for SidecarAudit {
    async fn process(
        &self,
        item: &Item,
    ) -> std::result::Result<ActionOutput<AuditOutcome>, ItemError> {
        let md = tokio::fs::metadata(&item.path).await?;
        if md.len() == 0 {
            return Err(ItemError::new("primary file is empty"));
        }

        let code = Self::code_for(item);
        let classified = self.table.classify(code);
        Ok(ActionOutput::new(classified.outcome).with_message(code.to_ascii_lowercase()))
    }
}
