//! Storable entities and the contract the store drives them through.
//!
//! Every record the store persists is an [`Entity`]: it knows its collection
//! root, derives its location from its identity fields, recovers those fields
//! from a stored key, validates itself and may register lifecycle [`Hooks`].
//! Generic traversal (list, watch, dump) works only through this trait.

mod archive;
mod codec;
mod global;
mod options;
mod policy;
mod runtime;
mod size;
mod use_lock;
mod validation;
mod volume;

pub use archive::*;
pub use codec::*;
pub use global::*;
pub use options::*;
pub use policy::*;
pub use runtime::*;
pub use size::*;
pub use use_lock::*;
pub(crate) use validation::*;
pub use volume::*;


use std::fmt;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Error;
use crate::Result;
use crate::Store;

/// Lifecycle callback run by the store around a CRUD operation.
///
/// An error aborts the operation before anything becomes persistent or
/// visible to the caller.
pub type Hook<E> = for<'a> fn(&'a Store, &'a mut E) -> BoxFuture<'a, Result<()>>;

/// Optional callbacks an entity registers with the store.
pub struct Hooks<E> {
    pub pre_get: Option<Hook<E>>,
    pub post_get: Option<Hook<E>>,
    pub pre_set: Option<Hook<E>>,
    pub post_set: Option<Hook<E>>,
    pub pre_delete: Option<Hook<E>>,
    pub post_delete: Option<Hook<E>>,
}

impl<E> Default for Hooks<E> {
    fn default() -> Self {
        Self {
            pre_get: None,
            post_get: None,
            pre_set: None,
            post_set: None,
            pre_delete: None,
            post_delete: None,
        }
    }
}

impl<E> fmt::Debug for Hooks<E> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("pre_get", &self.pre_get.is_some())
            .field("post_get", &self.post_get.is_some())
            .field("pre_set", &self.pre_set.is_some())
            .field("post_set", &self.post_set.is_some())
            .field("pre_delete", &self.pre_delete.is_some())
            .field("post_delete", &self.post_delete.is_some())
            .finish()
    }
}

/// A storable value type.
///
/// `Clone` must produce a fully independent copy; the store clones a template
/// entity for every record it materializes during list and watch.
pub trait Entity:
    Clone + fmt::Debug + fmt::Display + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Collection root this entity lives under.
    fn prefix(&self) -> &'static str;

    /// Fully qualified location relative to the store prefix.
    ///
    /// Fails when the identity fields are unset.
    fn path(&self) -> Result<String>;

    /// Repopulates identity fields from a stored key.
    ///
    /// Exact inverse of [`Entity::path`].
    fn set_key(
        &mut self,
        key: &str,
    ) -> Result<()>;

    /// Checks the entity and fills defaults in place.
    fn validate(&mut self) -> Result<()>;

    fn hooks(&self) -> Hooks<Self> {
        Hooks::default()
    }
}

/// An entity used as a cluster-wide mutual exclusion record.
///
/// The whole serialized payload is the lock identity: two locks are the same
/// lock only when their encodings are byte-identical.
pub trait Lock: Entity {
    fn owner(&self) -> &str;
    fn reason(&self) -> &str;
}

/// Strips a collection root and surrounding slashes from a store key.
pub(crate) fn key_suffix<'a>(
    key: &'a str,
    root: &str,
) -> &'a str {
    let key = key.trim_matches('/');
    key.strip_prefix(root).unwrap_or(key).trim_matches('/')
}

/// Splits a key below `root` into exactly `N` non-empty segments.
pub(crate) fn key_parts<const N: usize>(
    key: &str,
    root: &str,
    entity: &str,
) -> Result<[String; N]> {
    let suffix = key_suffix(key, root);
    let parts: Vec<&str> = suffix.split('/').collect();

    if parts.len() != N {
        return Err(Error::InvalidPath(format!(
            "key {key:?} does not name a {entity} under {root}"
        )));
    }

    if parts.iter().any(|p| p.is_empty()) {
        return Err(Error::InvalidPath(format!(
            "one part of key {key:?} for {entity} was empty"
        )));
    }

    Ok(std::array::from_fn(|i| parts[i].to_string()))
}
