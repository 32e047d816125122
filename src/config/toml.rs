use crate::config::{ConfigBackend, Configuration};
use anyhow::{Context, Error};
use std::path::Path;
use std::str::FromStr;
use toml_edit::{DocumentMut, Item, Table};

/// TOML backend. Saving merges into the existing file, so operator comments survive.
#[derive(Debug, Clone, Default)]
pub struct TomlConfiguration {
    document: DocumentMut,
}

impl TomlConfiguration {
    fn read<P: AsRef<Path>>(file: P) -> Result<Self, Error> {
        let file = file.as_ref();
        let text = std::fs::read_to_string(file)
            .with_context(|| format!("Reading configuration {} failed", file.display()))?;
        let document = DocumentMut::from_str(&text)
            .with_context(|| format!("Configuration {} is not valid TOML", file.display()))?;
        Ok(Self { document })
    }

    fn write<P: AsRef<Path>>(&self, file: P) -> Result<(), Error> {
        crate::util::write_atomic(file, self.document.to_string().as_bytes())?;
        Ok(())
    }

    fn merge(&mut self, config: &Configuration) -> Result<(), Error> {
        // to_document does not prettify, so go through a string
        let pretty = toml_edit::ser::to_string_pretty(config)?;
        let updated = DocumentMut::from_str(&pretty)?;
        merge_table(self.document.as_table_mut(), updated.as_table().clone());
        Ok(())
    }
}

/// Copies `updated` into `current`. Tables are merged recursively and replaced values keep the
/// decoration (comments, spacing) of the value they replace. Keys missing from `updated` go.
fn merge_table(current: &mut Table, updated: Table) {
    let stale: Vec<String> = current
        .iter()
        .map(|(key, _)| key.to_string())
        .filter(|key| !updated.contains_key(key))
        .collect();
    for key in stale {
        current.remove(&key);
    }
    for (key, item) in updated {
        let unmerged = match (current.get_mut(&key), item) {
            (Some(Item::Table(old)), Item::Table(new)) => {
                merge_table(old, new);
                None
            }
            (Some(Item::Value(old)), Item::Value(mut new)) => {
                *new.decor_mut() = old.decor().clone();
                *old = new;
                None
            }
            (_, item) => Some(item),
        };
        if let Some(item) = unmerged {
            current.insert(&key, item);
        }
    }
}

impl ConfigBackend for TomlConfiguration {
    fn load<P: AsRef<Path>>(file: P) -> Result<Configuration, Error> {
        let toml = Self::read(&file)?;
        toml_edit::de::from_document(toml.document)
            .with_context(|| format!("Invalid configuration in {}", file.as_ref().display()))
    }

    fn save<P: AsRef<Path>>(config: &Configuration, file: P) -> Result<(), Error> {
        let mut toml = Self::read(&file).unwrap_or_default();
        toml.merge(config)?;
        toml.write(file)
    }
}
