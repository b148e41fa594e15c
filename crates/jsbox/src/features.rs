//! Capability tokens negotiated with the helper at connect time.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// A capability the helper may advertise.
///
/// Callers must treat any feature missing from the negotiated
/// [`FeatureSet`] as absent and skip operations that depend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[non_exhaustive]
pub enum Feature {
    /// Closing an isolate interrupts running scripts.
    IsolateTermination,
    /// A promise completion value is awaited before the result is delivered.
    PromiseReturn,
    /// Named data can be provided and consumed as an `ArrayBuffer`.
    ProvideConsumeArrayBuffer,
    /// `WebAssembly.compile` of a consumed buffer is permitted.
    WasmCompilation,
    /// Per-isolate heap caps are honoured.
    IsolateMaxHeapSize,
}

impl Feature {
    /// Every feature this crate knows about.
    pub const ALL: [Feature; 5] = [
        Feature::IsolateTermination,
        Feature::PromiseReturn,
        Feature::ProvideConsumeArrayBuffer,
        Feature::WasmCompilation,
        Feature::IsolateMaxHeapSize,
    ];

    /// Wire name of the feature.
    pub fn as_str(self) -> &'static str {
        match self {
            Feature::IsolateTermination => "ISOLATE_TERMINATION",
            Feature::PromiseReturn => "PROMISE_RETURN",
            Feature::ProvideConsumeArrayBuffer => "PROVIDE_CONSUME_ARRAY_BUFFER",
            Feature::WasmCompilation => "WASM_COMPILATION",
            Feature::IsolateMaxHeapSize => "ISOLATE_MAX_HEAP_SIZE",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown feature name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown feature: {0}")]
pub struct UnknownFeature(pub String);

impl FromStr for Feature {
    type Err = UnknownFeature;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Feature::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| UnknownFeature(s.to_string()))
    }
}

/// The set of features advertised by a connected helper.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureSet {
    features: BTreeSet<Feature>,
}

impl FeatureSet {
    /// An empty set: nothing optional is available.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a set from wire names, ignoring names this crate does not know.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let features = names
            .into_iter()
            .filter_map(|name| match name.as_ref().parse::<Feature>() {
                Ok(feature) => Some(feature),
                Err(e) => {
                    tracing::debug!(error = %e, "ignoring unknown feature");
                    None
                }
            })
            .collect();
        Self { features }
    }

    /// Whether `feature` was advertised.
    pub fn contains(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    /// Iterate over the advertised features in a stable order.
    pub fn iter(&self) -> impl Iterator<Item = Feature> + '_ {
        self.features.iter().copied()
    }

    /// Wire names of the advertised features.
    pub fn names(&self) -> Vec<String> {
        self.iter().map(|f| f.as_str().to_string()).collect()
    }
}

impl FromIterator<Feature> for FeatureSet {
    fn from_iter<T: IntoIterator<Item = Feature>>(iter: T) -> Self {
        Self {
            features: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_parse_back_to_features() {
        for feature in Feature::ALL {
            assert_eq!(feature.as_str().parse::<Feature>().unwrap(), feature);
        }
    }

    #[test]
    fn unknown_name_is_a_std_error() {
        let err = "TELEPORTATION".parse::<Feature>().unwrap_err();
        assert_eq!(err, UnknownFeature("TELEPORTATION".into()));
        let boxed: Box<dyn std::error::Error> = Box::new(err);
        assert_eq!(boxed.to_string(), "unknown feature: TELEPORTATION");
    }

    #[test]
    fn unknown_names_are_ignored() {
        let set = FeatureSet::from_names(["PROMISE_RETURN", "TELEPORTATION"]);
        assert!(set.contains(Feature::PromiseReturn));
        assert_eq!(set.iter().count(), 1);
    }

    #[test]
    fn empty_set_supports_nothing() {
        let set = FeatureSet::empty();
        assert!(Feature::ALL.iter().all(|f| !set.contains(*f)));
    }

    #[test]
    fn collects_from_features() {
        let set: FeatureSet = [Feature::WasmCompilation, Feature::IsolateTermination]
            .into_iter()
            .collect();
        assert_eq!(
            set.names(),
            vec!["ISOLATE_TERMINATION".to_string(), "WASM_COMPILATION".to_string()]
        );
    }
}
