//! Direction keys and the named-alias <-> component/polarity mapping.
//!
//! A direction key is either `<component>_<positive|negative>` (PCA/latent
//! axes) or a semantic alias (`faster`/`slower`, `brighter`/`darker`, ...).
//! Every direction has a canonical opposite; aliases and PCA keys share the
//! same opposite-lookup rules so the Explorer doesn't need to special-case
//! them.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Polarity {
    Positive,
    Negative,
}

impl Polarity {
    pub fn flip(self) -> Self {
        match self {
            Polarity::Positive => Polarity::Negative,
            Polarity::Negative => Polarity::Positive,
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            Polarity::Positive => "positive",
            Polarity::Negative => "negative",
        }
    }
}

/// The fixed set of semantic aliases the Explorer recognizes in addition to
/// raw `<component>_<polarity>` keys. Each pair names a component and which
/// polarity the "positive"-sounding alias corresponds to.
const SEMANTIC_ALIASES: &[(&str, &str, &str)] = &[
    ("faster", "slower", "rhythmic_tempo"),
    ("brighter", "darker", "spectral_centroid"),
    ("denser", "sparser", "spectral_density"),
    ("warmer", "cooler", "tonal_warmth"),
];

/// A named, signed axis in feature space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Direction {
    pub key: String,
    pub component: String,
    pub polarity: Polarity,
    /// Statistical-anomaly axis rather than a continuous one.
    pub is_outlier: bool,
}

impl Direction {
    pub fn new(component: impl Into<String>, polarity: Polarity) -> Self {
        let component = component.into();
        let key = format!("{}_{}", component, polarity.suffix());
        Self {
            key,
            component,
            polarity,
            is_outlier: false,
        }
    }

    pub fn outlier(component: impl Into<String>, polarity: Polarity) -> Self {
        let mut d = Self::new(component, polarity);
        d.is_outlier = true;
        d
    }

    /// The canonical opposite direction key for any key this module
    /// recognizes (alias or `<component>_<polarity>`).
    pub fn opposite_key(key: &str) -> Option<String> {
        for (pos, neg, _component) in SEMANTIC_ALIASES {
            if key == *pos {
                return Some(neg.to_string());
            }
            if key == *neg {
                return Some(pos.to_string());
            }
        }
        if let Some(component) = key.strip_suffix("_positive") {
            return Some(format!("{}_negative", component));
        }
        if let Some(component) = key.strip_suffix("_negative") {
            return Some(format!("{}_positive", component));
        }
        None
    }

    /// Resolves a (possibly legacy-aliased) direction key to the
    /// `(component, polarity)` pair the Feature Index understands. Legacy
    /// resolution-knob names are handled separately in `ExplorerResolution`;
    /// this only covers direction *names*.
    pub fn resolve_alias(key: &str) -> Option<(String, Polarity)> {
        for (pos, neg, component) in SEMANTIC_ALIASES {
            if key == *pos {
                return Some((component.to_string(), Polarity::Positive));
            }
            if key == *neg {
                return Some((component.to_string(), Polarity::Negative));
            }
        }
        if let Some(component) = key.strip_suffix("_positive") {
            return Some((component.to_string(), Polarity::Positive));
        }
        if let Some(component) = key.strip_suffix("_negative") {
            return Some((component.to_string(), Polarity::Negative));
        }
        None
    }

    /// The semantic-alias spelling for a component+polarity pair, if this
    /// component has one — the inverse of `resolve_alias`. The Explorer uses
    /// this to key a `Direction` by its alias (`"faster"`) instead of the
    /// raw component form (`"rhythmic_tempo_positive"`) whenever one exists.
    pub fn alias_for(component: &str, polarity: Polarity) -> Option<&'static str> {
        for (pos, neg, c) in SEMANTIC_ALIASES {
            if *c == component {
                return Some(match polarity {
                    Polarity::Positive => pos,
                    Polarity::Negative => neg,
                });
            }
        }
        None
    }

    /// Builds a `Direction`, preferring the semantic-alias key
    /// (`"faster"`/`"brighter"`/...) over the raw `<component>_<polarity>`
    /// form when the component has a known alias pair.
    pub fn new_aliased(component: impl Into<String>, polarity: Polarity) -> Self {
        let component = component.into();
        let key = Direction::alias_for(&component, polarity)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}_{}", component, polarity.suffix()));
        Self {
            key,
            component,
            polarity,
            is_outlier: false,
        }
    }
}

/// The explorer resolution knob. `Adaptive` is the only behaviorally
/// distinct mode; the legacy names are aliased to it (spec.md's Open
/// Questions leaves this choice to the implementer, see DESIGN.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExplorerResolution {
    Adaptive,
}

impl ExplorerResolution {
    /// Parses a resolution mode name, aliasing every legacy spelling to
    /// `Adaptive` per the DESIGN.md decision.
    pub fn parse(name: &str) -> Self {
        match name {
            "microscope" | "magnifying" | "binoculars" | "adaptive" => {
                ExplorerResolution::Adaptive
            }
            _ => ExplorerResolution::Adaptive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pca_key_opposite_flips_polarity() {
        assert_eq!(
            Direction::opposite_key("tonal_pc1_positive"),
            Some("tonal_pc1_negative".to_string())
        );
    }

    #[test]
    fn alias_opposite_is_the_paired_alias() {
        assert_eq!(Direction::opposite_key("faster"), Some("slower".to_string()));
        assert_eq!(Direction::opposite_key("slower"), Some("faster".to_string()));
    }

    #[test]
    fn legacy_resolution_names_alias_to_adaptive() {
        assert_eq!(ExplorerResolution::parse("microscope"), ExplorerResolution::Adaptive);
        assert_eq!(ExplorerResolution::parse("magnifying"), ExplorerResolution::Adaptive);
        assert_eq!(ExplorerResolution::parse("binoculars"), ExplorerResolution::Adaptive);
        assert_eq!(ExplorerResolution::parse("anything-else"), ExplorerResolution::Adaptive);
    }

    #[test]
    fn resolve_alias_maps_to_component_and_polarity() {
        let (component, polarity) = Direction::resolve_alias("faster").unwrap();
        assert_eq!(component, "rhythmic_tempo");
        assert_eq!(polarity, Polarity::Positive);
    }

    #[test]
    fn new_aliased_prefers_the_semantic_alias_key() {
        let d = Direction::new_aliased("rhythmic_tempo", Polarity::Positive);
        assert_eq!(d.key, "faster");
        let d = Direction::new_aliased("rhythmic_tempo", Polarity::Negative);
        assert_eq!(d.key, "slower");
    }

    #[test]
    fn new_aliased_falls_back_to_raw_key_without_an_alias() {
        let d = Direction::new_aliased("tonal_pc1", Polarity::Positive);
        assert_eq!(d.key, "tonal_pc1_positive");
    }

    #[test]
    fn alias_and_resolve_alias_round_trip() {
        let alias = Direction::alias_for("spectral_centroid", Polarity::Negative).unwrap();
        assert_eq!(alias, "darker");
        let (component, polarity) = Direction::resolve_alias(alias).unwrap();
        assert_eq!(component, "spectral_centroid");
        assert_eq!(polarity, Polarity::Negative);
    }
}
