pub mod aggregates;
pub mod logs;
pub mod payloads;
pub mod privacy;
pub mod transactions;

/// Upsert key of a published row. Republishing a row under the same key replaces it.
pub trait NaturalKey {
    fn natural_key(&self) -> String;
}
