//! The product model registry: which data point switches each model of
//! device on and off.

use serde::{Deserialize, Serialize};

/// One product model: Tuya's product key, a friendly name and the index
/// of the boolean data point that drives on/off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub control: u32,
}

/// Ordered list of known models, searched linearly by case-insensitive
/// product key. Mutation comes from configuration reloads only.
#[derive(Debug, Default)]
pub struct ModelTable {
    models: Vec<Model>,
    changed: bool,
}

impl ModelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    fn search(&self, id: &str) -> Option<usize> {
        self.models.iter().position(|m| m.id.eq_ignore_ascii_case(id))
    }

    /// Friendly name for a product key, if known.
    pub fn name(&self, id: &str) -> Option<&str> {
        self.search(id).map(|i| self.models[i].name.as_str())
    }

    /// Control data point for a product key. Zero means unknown, which
    /// disables sense and control for devices of that model.
    pub fn control(&self, id: &str) -> u32 {
        self.search(id).map_or(0, |i| self.models[i].control)
    }

    /// Merge one configured model, flagging the table dirty on any change.
    pub fn refresh(&mut self, model: &Model) {
        match self.search(&model.id) {
            Some(i) => {
                let entry = &mut self.models[i];
                if entry.name != model.name {
                    entry.name = model.name.clone();
                    self.changed = true;
                }
                if entry.control != model.control {
                    entry.control = model.control;
                    self.changed = true;
                }
            }
            None => {
                self.models.push(model.clone());
                self.changed = true;
            }
        }
    }

    /// Snapshot for config export.
    pub fn live_config(&self) -> Vec<Model> {
        self.models.clone()
    }

    /// Report and clear the dirty flag.
    pub fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }
}
