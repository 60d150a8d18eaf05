use tracing::warn;

use sidecar_core::{Addon, RequestMode};

use crate::error::ConfigError;

/// Batch add-ons sharing one `(provider, model)`, sent as a single upstream call.
#[derive(Clone, Debug)]
pub struct BatchGroup {
    pub provider: String,
    pub model: String,
    pub addons: Vec<Addon>,
}

impl BatchGroup {
    pub fn key(&self) -> String {
        format!("{}/{}", self.provider, self.model)
    }

    /// Every member must carry the group's provider and model exactly.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for addon in &self.addons {
            if addon.provider != self.provider || addon.model != self.model {
                return Err(ConfigError::MismatchedGroup {
                    addon_id: addon.id.clone(),
                    expected: self.key(),
                    found: format!("{}/{}", addon.provider, addon.model),
                });
            }
        }
        Ok(())
    }
}

/// How one cycle's run-set will be executed.
#[derive(Debug, Default)]
pub struct ExecutionPlan {
    pub batches: Vec<BatchGroup>,
    pub standalone: Vec<Addon>,
    /// Add-ons that cannot be scheduled, with the reason.
    pub rejected: Vec<(Addon, ConfigError)>,
}

impl ExecutionPlan {
    /// Number of execution units (batch groups count once).
    pub fn unit_count(&self) -> usize {
        self.batches.len() + self.standalone.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unit_count() == 0 && self.rejected.is_empty()
    }
}

/// Partition a run-set into batch groups keyed by `(provider, model)` and a
/// standalone list. Groups keep first-seen order.
pub fn plan(addons: Vec<Addon>) -> ExecutionPlan {
    let mut out = ExecutionPlan::default();
    for addon in addons {
        if addon.request_mode != RequestMode::Batch {
            out.standalone.push(addon);
            continue;
        }
        if addon.provider.is_empty() || addon.model.is_empty() {
            let err = ConfigError::MissingModel {
                addon_id: addon.id.clone(),
            };
            warn!(addon_id = %addon.id, error = %err, "batch add-on rejected");
            out.rejected.push((addon, err));
            continue;
        }
        match out
            .batches
            .iter_mut()
            .find(|g| g.provider == addon.provider && g.model == addon.model)
        {
            Some(group) => group.addons.push(addon),
            None => out.batches.push(BatchGroup {
                provider: addon.provider.clone(),
                model: addon.model.clone(),
                addons: vec![addon],
            }),
        }
    }
    out
}
