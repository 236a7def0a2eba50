//! Persisted business entity mutated by logic steps
use std::collections::BTreeMap;
use std::sync::Arc;

use super::snapshot::Value;
use super::utils;

fn entity_key(entity_id: &str) -> String {
    format!("entity/{entity_id}")
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct Entity {
    #[n(0)]
    pub entity_id: String,
    #[n(1)]
    pub external_ref: String, // natural key, used for lock scoping
    #[n(2)]
    pub entity_type: String,
    #[n(3)]
    pub fields: BTreeMap<String, Value>,
}

impl Entity {
    /// Mint a new entity with a bech32-encoded id used as both the
    /// persistence key and the external reference.
    pub fn new(entity_type: &str) -> anyhow::Result<Self> {
        let entity_id = utils::new_uuid_to_bech32("ent_")?;
        Ok(Self::new_with(&entity_id, entity_type))
    }

    pub fn new_with(entity_id: &str, entity_type: &str) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            external_ref: entity_id.to_string(),
            entity_type: entity_type.to_string(),
            fields: BTreeMap::new(),
        }
    }

    pub fn field(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn set_field(&mut self, field: &str, value: Value) {
        self.fields.insert(field.to_string(), value);
    }

    /// Load an entity by id; `None` means it no longer exists (deleted
    /// concurrently), which callers treat as a benign no-op.
    pub fn load_from_db(db: &Arc<sled::Db>, entity_id: &str) -> anyhow::Result<Option<Entity>> {
        match db.get(entity_key(entity_id).as_bytes())? {
            Some(raw) => Ok(Some(minicbor::decode(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn save_to_db(&self, db: &Arc<sled::Db>) -> anyhow::Result<()> {
        db.insert(
            entity_key(&self.entity_id).as_bytes(),
            minicbor::to_vec(self)?,
        )?;
        Ok(())
    }

    pub fn delete_from_db(db: &Arc<sled::Db>, entity_id: &str) -> anyhow::Result<()> {
        db.remove(entity_key(entity_id).as_bytes())?;
        Ok(())
    }
}
