//! Component Selector
//!
//! A bitmask over the three object components. Partial reads, updates and
//! deletes take a selector naming the components they touch.
//!
//! ```rust
//! use easystore_core::models::ComponentSelector;
//!
//! let selector = ComponentSelector::FIELDS | ComponentSelector::FILES;
//! assert!(selector.contains(ComponentSelector::FIELDS));
//! assert!(!selector.contains(ComponentSelector::METADATA));
//! assert_eq!(selector.to_wire().as_deref(), Some("fields,files"));
//! ```

use crate::error::{Result, StoreError};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Bit flags over {Fields, Files, Metadata}
///
/// The raw value is public so callers (and the wire layer) can construct any
/// bit pattern; [`ComponentSelector::validate`] rejects values outside
/// `0..=ALL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ComponentSelector(pub u8);

impl ComponentSelector {
    /// Base object only, no components
    pub const BASE: ComponentSelector = ComponentSelector(0);
    pub const FIELDS: ComponentSelector = ComponentSelector(1);
    pub const FILES: ComponentSelector = ComponentSelector(2);
    pub const METADATA: ComponentSelector = ComponentSelector(4);
    pub const ALL: ComponentSelector = ComponentSelector(7);

    /// Fail `BadParameter` for any value above [`ComponentSelector::ALL`]
    pub fn validate(self) -> Result<Self> {
        if self.0 > Self::ALL.0 {
            return Err(StoreError::bad_parameter(format!(
                "component selector {} is out of range (max {})",
                self.0,
                Self::ALL.0
            )));
        }
        Ok(self)
    }

    pub fn is_base(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: ComponentSelector) -> bool {
        other.0 != 0 && (self.0 & other.0) == other.0
    }

    /// Encode for the `attribs` query parameter
    ///
    /// `None` for the base selector (the parameter is omitted), `all` for
    /// every component, otherwise the selected names in canonical order.
    pub fn to_wire(self) -> Option<String> {
        if self.is_base() {
            return None;
        }
        if self == Self::ALL {
            return Some("all".to_string());
        }

        let names: Vec<&str> = [
            (Self::FIELDS, "fields"),
            (Self::FILES, "files"),
            (Self::METADATA, "metadata"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| name)
        .collect();

        Some(names.join(","))
    }

    /// Decode an `attribs` query parameter (absent or empty means base)
    pub fn from_wire(value: Option<&str>) -> Result<Self> {
        let Some(value) = value else {
            return Ok(Self::BASE);
        };

        let mut selector = Self::BASE;
        for token in value.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            selector |= match token.to_ascii_lowercase().as_str() {
                "fields" => Self::FIELDS,
                "files" => Self::FILES,
                "metadata" => Self::METADATA,
                "all" => Self::ALL,
                other => {
                    return Err(StoreError::bad_parameter(format!(
                        "unknown component '{}' in attribs",
                        other
                    )))
                }
            };
        }
        Ok(selector)
    }
}

impl BitOr for ComponentSelector {
    type Output = ComponentSelector;

    fn bitor(self, rhs: Self) -> Self::Output {
        ComponentSelector(self.0 | rhs.0)
    }
}

impl BitOrAssign for ComponentSelector {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for ComponentSelector {
    type Output = ComponentSelector;

    fn bitand(self, rhs: Self) -> Self::Output {
        ComponentSelector(self.0 & rhs.0)
    }
}

impl fmt::Display for ComponentSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_wire() {
            Some(wire) => f.write_str(&wire),
            None => f.write_str("base"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_are_disjoint_and_compose_to_all() {
        let all = ComponentSelector::FIELDS | ComponentSelector::FILES | ComponentSelector::METADATA;
        assert_eq!(all, ComponentSelector::ALL);
        assert!((ComponentSelector::FIELDS & ComponentSelector::FILES).is_base());
        assert!(!ComponentSelector::BASE.contains(ComponentSelector::BASE));
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        assert!(ComponentSelector(7).validate().is_ok());
        let err = ComponentSelector(8).validate().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BadParameter);
    }

    #[test]
    fn test_wire_encoding() {
        assert_eq!(ComponentSelector::BASE.to_wire(), None);
        assert_eq!(ComponentSelector::ALL.to_wire().as_deref(), Some("all"));
        assert_eq!(
            (ComponentSelector::METADATA | ComponentSelector::FIELDS)
                .to_wire()
                .as_deref(),
            Some("fields,metadata")
        );
    }

    #[test]
    fn test_wire_decoding_is_lenient_about_order_and_case() {
        assert_eq!(
            ComponentSelector::from_wire(Some("Metadata,fields,fields")).unwrap(),
            ComponentSelector::FIELDS | ComponentSelector::METADATA
        );
        assert_eq!(
            ComponentSelector::from_wire(Some("all")).unwrap(),
            ComponentSelector::ALL
        );
        assert_eq!(
            ComponentSelector::from_wire(None).unwrap(),
            ComponentSelector::BASE
        );
        assert!(ComponentSelector::from_wire(Some("fields,thumbnails")).is_err());
    }
}
