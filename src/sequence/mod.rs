//! Sequence tree: samples own contacts, contacts own measurements.
//!
//! The tree is a strict ownership hierarchy. Nodes are addressed with [`NodePath`]
//! (index paths) instead of parent back-references; the executor carries the sample
//! and contact it is working on when it needs their names for result labeling.
//!
//! States only flow upward: the executor sets a container's state from the results of
//! its children and never pushes a state down into them.

pub mod position;
pub mod state;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::parameter::{ParameterMap, ParameterValue};

pub use position::Position;
pub use state::ItemState;

/// Ordered `(x, y)` points of one plotted series.
pub type SeriesPoints = Vec<(f64, f64)>;

/// Address of a node in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodePath {
    /// All samples
    Root,
    /// Sample index
    Sample(usize),
    /// Sample and contact index
    Contact(usize, usize),
    /// Sample, contact and measurement index
    Measurement(usize, usize, usize),
}

/// A single measurement to execute.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementNode {
    /// Stable identifier used in file names
    pub id: String,
    /// Display name
    pub name: String,
    /// Measurement type, key into the measurement registry
    #[serde(rename = "type")]
    pub type_name: String,
    /// Whether the node takes part in the run
    pub enabled: bool,
    /// Parameters supplied by the sequence
    pub parameters: ParameterMap,
    /// Per-type defaults merged under `parameters`
    pub default_parameters: ParameterMap,
    /// Free text
    pub description: String,
    /// Current state
    pub state: Option<ItemState>,
    /// Quality label from analysis
    pub quality: Option<String>,
    /// Plotted readings collected during the run
    pub series: IndexMap<String, SeriesPoints>,
    /// Analysis results
    pub analysis: IndexMap<String, serde_json::Value>,
    /// Number of re-measurements in this run
    pub remeasure: u32,
}

impl MeasurementNode {
    /// Create an enabled node.
    pub fn new(id: impl Into<String>, name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            type_name: type_name.into(),
            enabled: true,
            ..Self::default()
        }
    }

    /// Builder: set a parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Defaults overlaid with supplied parameters.
    pub fn effective_parameters(&self) -> ParameterMap {
        let mut merged = self.default_parameters.clone();
        for (key, value) in &self.parameters {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }

    /// Clear state, quality, series and analysis but keep the remeasure counter.
    pub fn clear_results(&mut self) {
        self.state = None;
        self.quality = None;
        self.series.clear();
        self.analysis.clear();
    }

    /// Clear state, quality, counters, series and analysis.
    pub fn reset(&mut self) {
        self.clear_results();
        self.remeasure = 0;
    }
}

/// One probing location on a sample.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Contact {
    /// Stable identifier used in file names
    pub id: String,
    /// Display name
    pub name: String,
    /// Free text
    pub description: String,
    /// Whether the node takes part in the run
    pub enabled: bool,
    /// Table position, NaN components mean unset
    pub position: Position,
    /// Current state
    pub state: Option<ItemState>,
    /// Quality label
    pub quality: Option<String>,
    /// Number of re-contacts in this run
    pub recontact: u32,
    /// Measurements in execution order
    pub measurements: Vec<MeasurementNode>,
}

impl Contact {
    /// Create an enabled contact without position.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            enabled: true,
            ..Self::default()
        }
    }

    /// Builder: set the position.
    pub fn with_position(mut self, position: impl Into<Position>) -> Self {
        self.position = position.into();
        self
    }

    /// Builder: append a measurement.
    pub fn with_measurement(mut self, measurement: MeasurementNode) -> Self {
        self.measurements.push(measurement);
        self
    }

    /// True if no position component is NaN.
    pub fn has_position(&self) -> bool {
        self.position.is_valid()
    }

    /// Clear state, counters and all measurements.
    pub fn reset(&mut self) {
        self.state = None;
        self.quality = None;
        self.recontact = 0;
        self.measurements.iter_mut().for_each(MeasurementNode::reset);
    }
}

/// A sample (halfmoon) with its contacts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Sample {
    /// Name prefix
    pub name_prefix: String,
    /// Name infix
    pub name_infix: String,
    /// Name suffix
    pub name_suffix: String,
    /// Sample type
    pub sample_type: String,
    /// Free text written to meta data
    pub comment: String,
    /// Whether the node takes part in the run
    pub enabled: bool,
    /// Current state
    pub state: Option<ItemState>,
    /// Quality label
    pub quality: Option<String>,
    /// Contacts in execution order
    pub contacts: Vec<Contact>,
}

impl Sample {
    /// Create an enabled sample named by its infix.
    pub fn new(name: impl Into<String>, sample_type: impl Into<String>) -> Self {
        Self {
            name_infix: name.into(),
            sample_type: sample_type.into(),
            enabled: true,
            ..Self::default()
        }
    }

    /// Builder: append a contact.
    pub fn with_contact(mut self, contact: Contact) -> Self {
        self.contacts.push(contact);
        self
    }

    /// Composite name: prefix + infix + suffix, trimmed.
    pub fn name(&self) -> String {
        format!("{}{}{}", self.name_prefix, self.name_infix, self.name_suffix)
            .trim()
            .to_string()
    }

    /// Sample type, trimmed.
    pub fn sample_type(&self) -> &str {
        self.sample_type.trim()
    }

    /// Clear state and all contacts.
    pub fn reset(&mut self) {
        self.state = None;
        self.quality = None;
        self.contacts.iter_mut().for_each(Contact::reset);
    }
}

/// Root of the sequence: all samples of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceTree {
    /// Samples in execution order
    pub samples: Vec<Sample>,
    /// Aggregate state of the whole run
    pub state: Option<ItemState>,
}

impl SequenceTree {
    /// Create a tree from samples.
    pub fn new(samples: Vec<Sample>) -> Self {
        Self {
            samples,
            state: None,
        }
    }

    /// Clear states, counters, series and analysis recursively.
    pub fn reset(&mut self) {
        self.state = None;
        self.samples.iter_mut().for_each(Sample::reset);
    }

    /// Sample at `index`.
    pub fn sample(&self, index: usize) -> Option<&Sample> {
        self.samples.get(index)
    }

    /// Contact at `(sample, contact)`.
    pub fn contact(&self, sample: usize, contact: usize) -> Option<&Contact> {
        self.samples.get(sample)?.contacts.get(contact)
    }

    /// Mutable contact at `(sample, contact)`.
    pub fn contact_mut(&mut self, sample: usize, contact: usize) -> Option<&mut Contact> {
        self.samples.get_mut(sample)?.contacts.get_mut(contact)
    }

    /// Measurement at `(sample, contact, measurement)`.
    pub fn measurement(&self, sample: usize, contact: usize, measurement: usize) -> Option<&MeasurementNode> {
        self.contact(sample, contact)?.measurements.get(measurement)
    }

    /// Mutable measurement at `(sample, contact, measurement)`.
    pub fn measurement_mut(
        &mut self,
        sample: usize,
        contact: usize,
        measurement: usize,
    ) -> Option<&mut MeasurementNode> {
        self.contact_mut(sample, contact)?
            .measurements
            .get_mut(measurement)
    }

    /// True if `path` exists.
    pub fn contains(&self, path: NodePath) -> bool {
        match path {
            NodePath::Root => true,
            NodePath::Sample(s) => self.sample(s).is_some(),
            NodePath::Contact(s, c) => self.contact(s, c).is_some(),
            NodePath::Measurement(s, c, m) => self.measurement(s, c, m).is_some(),
        }
    }

    /// True if the node and every ancestor is enabled. The root is always enabled.
    pub fn is_runnable(&self, path: NodePath) -> bool {
        match path {
            NodePath::Root => true,
            NodePath::Sample(s) => self.sample(s).is_some_and(|sample| sample.enabled),
            NodePath::Contact(s, c) => {
                self.is_runnable(NodePath::Sample(s))
                    && self.contact(s, c).is_some_and(|contact| contact.enabled)
            }
            NodePath::Measurement(s, c, m) => {
                self.is_runnable(NodePath::Contact(s, c))
                    && self.measurement(s, c, m).is_some_and(|node| node.enabled)
            }
        }
    }

    /// Current state of the node at `path`.
    pub fn state(&self, path: NodePath) -> Option<ItemState> {
        match path {
            NodePath::Root => self.state,
            NodePath::Sample(s) => self.sample(s)?.state,
            NodePath::Contact(s, c) => self.contact(s, c)?.state,
            NodePath::Measurement(s, c, m) => self.measurement(s, c, m)?.state,
        }
    }

    /// Set the state of the node at `path`. Unknown paths are ignored.
    pub fn set_state(&mut self, path: NodePath, state: Option<ItemState>) {
        match path {
            NodePath::Root => self.state = state,
            NodePath::Sample(s) => {
                if let Some(sample) = self.samples.get_mut(s) {
                    sample.state = state;
                }
            }
            NodePath::Contact(s, c) => {
                if let Some(contact) = self.contact_mut(s, c) {
                    contact.state = state;
                }
            }
            NodePath::Measurement(s, c, m) => {
                if let Some(node) = self.measurement_mut(s, c, m) {
                    node.state = state;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> SequenceTree {
        SequenceTree::new(vec![Sample::new("HM", "A").with_contact(
            Contact::new("c1", "Flute 1")
                .with_position((1.0, 2.0, 3.0))
                .with_measurement(MeasurementNode::new("m1", "IV", "iv_ramp"))
                .with_measurement(MeasurementNode::new("m2", "CV", "cv_ramp")),
        )])
    }

    #[test]
    fn sample_name_is_trimmed_concatenation() {
        let sample = Sample {
            name_prefix: " PQC_".into(),
            name_infix: "HM".into(),
            name_suffix: "_01 ".into(),
            ..Sample::default()
        };
        assert_eq!(sample.name(), "PQC_HM_01");
    }

    #[test]
    fn runnable_requires_enabled_ancestors() {
        let mut tree = tree();
        assert!(tree.is_runnable(NodePath::Measurement(0, 0, 1)));
        tree.samples[0].contacts[0].enabled = false;
        assert!(!tree.is_runnable(NodePath::Measurement(0, 0, 1)));
        assert!(tree.is_runnable(NodePath::Sample(0)));
        assert!(!tree.is_runnable(NodePath::Measurement(3, 0, 0)));
    }

    #[test]
    fn reset_clears_recursively() {
        let mut tree = tree();
        tree.set_state(NodePath::Root, Some(ItemState::Error));
        tree.set_state(NodePath::Measurement(0, 0, 0), Some(ItemState::Success));
        {
            let contact = tree.contact_mut(0, 0).unwrap();
            contact.recontact = 2;
            contact.measurements[0].remeasure = 1;
            contact.measurements[0]
                .series
                .insert("hvsrc".into(), vec![(0.0, 1e-9)]);
        }
        tree.reset();
        assert_eq!(tree.state(NodePath::Root), None);
        let contact = tree.contact(0, 0).unwrap();
        assert_eq!(contact.recontact, 0);
        assert_eq!(contact.measurements[0].state, None);
        assert_eq!(contact.measurements[0].remeasure, 0);
        assert!(contact.measurements[0].series.is_empty());
    }

    #[test]
    fn effective_parameters_overlay_defaults() {
        let mut node = MeasurementNode::new("m1", "IV", "iv_ramp")
            .with_parameter("voltage_stop", "-100 V");
        node.default_parameters
            .insert("voltage_stop".into(), "-1000 V".into());
        node.default_parameters
            .insert("waiting_time".into(), "1 s".into());
        let merged = node.effective_parameters();
        assert_eq!(merged["voltage_stop"].as_str(), Some("-100 V"));
        assert_eq!(merged["waiting_time"].as_str(), Some("1 s"));
    }

    #[test]
    fn deserializes_from_json() {
        let tree: SequenceTree = serde_json::from_str(
            r#"{"samples": [{"name_infix": "HM", "enabled": true, "contacts": [
                {"id": "c", "name": "C", "enabled": true, "position": {"x": 1.0, "y": 2.0, "z": 0.0},
                 "measurements": [{"id": "iv", "name": "IV", "type": "iv_ramp", "enabled": true,
                                   "parameters": {"voltage_stop": "10 V"}}]}]}]}"#,
        )
        .unwrap();
        let node = tree.measurement(0, 0, 0).unwrap();
        assert_eq!(node.type_name, "iv_ramp");
        assert!(tree.contact(0, 0).unwrap().has_position());
    }
}
