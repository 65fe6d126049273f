mod sequence_classifier;
pub use sequence_classifier::{ElectraSequenceClassifier, HFElectraSequenceClassifierConfig};
