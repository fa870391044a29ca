use std::io::Read;

use once_cell::sync::Lazy;

use flashkit_target::{ChipFamily, TargetDescriptionSource};

use super::target::Target;

/// An error while looking up or loading a target description.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The requested chip was not found in the registry.
    #[error("the chip '{0}' was not found in the registry")]
    ChipNotFound(String),
    /// A target description failed validation and cannot be used.
    #[error("the chip family '{family}' is invalid: {error}")]
    Validation {
        /// The name of the invalid family.
        family: String,
        /// What is wrong with the description.
        error: String,
    },
    /// Reading a target description failed.
    #[error("reading the target description failed")]
    Io(#[from] std::io::Error),
    /// Deserializing a target description failed.
    #[error("deserializing the target description failed")]
    Yaml(#[from] serde_yaml::Error),
}

/// The target families compiled into the binary.
///
/// Builtin descriptions are trusted; an invalid one is a packaging defect,
/// so it panics at first access instead of surfacing a runtime error.
static BUILTIN_FAMILIES: Lazy<Vec<ChipFamily>> = Lazy::new(|| {
    let sources = [include_str!("../../targets/STM32F4_Series.yaml")];

    sources
        .iter()
        .map(|source| {
            let mut family: ChipFamily =
                serde_yaml::from_str(source).expect("builtin target description must parse");
            family.source = TargetDescriptionSource::BuiltIn;
            if let Err(error) = family.validate() {
                panic!(
                    "builtin target description {} is invalid: {}",
                    family.name, error
                );
            }
            family
        })
        .collect()
});

/// Registry of all available targets.
///
/// The registry is populated once at startup and then only read; sessions
/// against different targets share it by reference.
pub struct Registry {
    /// All the available chip families.
    families: Vec<ChipFamily>,
}

impl Registry {
    /// Creates a registry containing the families compiled into the binary.
    pub fn from_builtin_families() -> Self {
        Self {
            families: BUILTIN_FAMILIES.clone(),
        }
    }

    /// Creates an empty registry.
    pub fn new() -> Self {
        Self { families: vec![] }
    }

    /// All families known to this registry.
    pub fn families(&self) -> &[ChipFamily] {
        &self.families
    }

    /// Adds a validated family to the registry.
    ///
    /// A family with the same name replaces the previously registered one.
    pub fn add_target_family(&mut self, family: ChipFamily) -> Result<(), RegistryError> {
        family.validate().map_err(|error| RegistryError::Validation {
            family: family.name.clone(),
            error,
        })?;

        if let Some(existing) = self
            .families
            .iter()
            .position(|known| known.name == family.name)
        {
            self.families.remove(existing);
        }
        self.families.push(family);

        Ok(())
    }

    /// Reads a YAML target description and adds it to the registry.
    ///
    /// Returns the name of the added family.
    pub fn add_target_family_from_yaml<R: Read>(
        &mut self,
        reader: R,
    ) -> Result<String, RegistryError> {
        let family: ChipFamily = serde_yaml::from_reader(reader)?;
        let name = family.name.clone();
        self.add_target_family(family)?;

        Ok(name)
    }

    /// Resolves a target by chip name.
    ///
    /// The name is matched case-insensitively. If no variant matches exactly,
    /// a variant whose name starts with the requested name is used, with a
    /// warning.
    pub fn get_target(&self, name: &str) -> Result<Target, RegistryError> {
        let name = name.to_ascii_lowercase();

        let mut partial_match = None;
        for family in &self.families {
            for variant in family.variants() {
                let variant_name = variant.name.to_ascii_lowercase();
                if variant_name == name {
                    return Ok(Target::from_family_and_variant(family, variant));
                }
                if partial_match.is_none() && variant_name.starts_with(&name) {
                    partial_match = Some((family, variant));
                }
            }
        }

        let (family, variant) =
            partial_match.ok_or_else(|| RegistryError::ChipNotFound(name.clone()))?;

        tracing::warn!(
            "Found chip {} which matches given partial name {}. Consider specifying its full name.",
            variant.name,
            name,
        );

        Ok(Target::from_family_and_variant(family, variant))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::from_builtin_families()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_families_are_valid() {
        let registry = Registry::from_builtin_families();
        assert!(!registry.families().is_empty());
    }

    #[test]
    fn fetch_by_exact_name() {
        let registry = Registry::from_builtin_families();
        let target = registry.get_target("STM32F405RG").unwrap();
        assert_eq!(target.name, "STM32F405RG");
        assert_eq!(target.flash_algorithms.len(), 1);
    }

    #[test]
    fn fetch_is_case_insensitive() {
        let registry = Registry::from_builtin_families();
        assert!(registry.get_target("stm32f405rg").is_ok());
    }

    #[test]
    fn fetch_by_partial_name() {
        let registry = Registry::from_builtin_families();
        let target = registry.get_target("stm32f405").unwrap();
        assert!(target.name.starts_with("STM32F405"));
    }

    #[test]
    fn fetch_unknown_chip_fails() {
        let registry = Registry::from_builtin_families();
        assert!(matches!(
            registry.get_target("ATmega328"),
            Err(RegistryError::ChipNotFound(_))
        ));
    }

    #[test]
    fn adding_an_invalid_family_fails() {
        let yaml = r#"
            name: Broken Family
            variants:
              - name: BROKEN01
                cores: []
                memory_map: []
                flash_algorithms: []
        "#;

        let mut registry = Registry::new();
        assert!(matches!(
            registry.add_target_family_from_yaml(yaml.as_bytes()),
            Err(RegistryError::Validation { .. })
        ));
    }

    #[test]
    fn adding_a_family_replaces_the_previous_one() {
        let mut registry = Registry::from_builtin_families();
        let family = registry.families()[0].clone();
        let count = registry.families().len();

        registry.add_target_family(family).unwrap();
        assert_eq!(registry.families().len(), count);
    }
}
