//! Finding key objects by identifier and label.
//!
//! Object handles are only valid within the session that found them, and a handle can go stale when another
//! application deletes or re-creates an object. So handles are never kept beyond a single operation: an
//! [`ObjectResolver`] lives for exactly one session checkout and caches what it found for that long.
use std::{collections::HashMap, fmt};

use log::{debug, trace};

use crate::{
    error::Error,
    keys::KeyIdentity,
    token::{Attribute, KeyType, ObjectClass, ObjectHandle, SlotId, TokenError, TokenSession},
};

//------------ KeyQuery ----------------------------------------------------------------------------------------------

/// What to look for: an identity plus the class and (optionally) key type of the object.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub(crate) struct KeyQuery {
    identity: KeyIdentity,
    class: ObjectClass,
    key_type: Option<KeyType>,
}

impl KeyQuery {
    /// Fails with [`Error::InvalidArgument`] if the identity has neither identifier nor label.
    pub fn new(identity: KeyIdentity, class: ObjectClass) -> Result<Self, Error> {
        if identity.is_empty() {
            return Err(Error::invalid_argument(
                "at least one of key identifier and label must be given",
            ));
        }
        Ok(KeyQuery {
            identity,
            class,
            key_type: None,
        })
    }

    pub fn with_key_type(mut self, key_type: KeyType) -> Self {
        self.key_type = Some(key_type);
        self
    }

    fn template(&self) -> Vec<Attribute> {
        let mut template = vec![Attribute::Class(self.class)];
        if let Some(key_type) = self.key_type {
            template.push(Attribute::KeyType(key_type));
        }
        template.extend(self.identity.template());
        template
    }
}

impl fmt::Display for KeyQuery {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.key_type {
            Some(key_type) => write!(f, "{} {} {}", key_type, self.class, self.identity),
            None => write!(f, "{} {}", self.class, self.identity),
        }
    }
}

//------------ ObjectResolver ----------------------------------------------------------------------------------------

pub(crate) struct ObjectResolver<'a> {
    session: &'a dyn TokenSession,
    slot: SlotId,
    cache: HashMap<(KeyQuery, SlotId), ObjectHandle>,
}

impl<'a> ObjectResolver<'a> {
    pub fn new(session: &'a dyn TokenSession, slot: SlotId) -> Self {
        ObjectResolver {
            session,
            slot,
            cache: HashMap::new(),
        }
    }

    pub fn session(&self) -> &'a dyn TokenSession {
        self.session
    }

    /// Find the single object matching the query.
    pub fn find_one(&mut self, query: &KeyQuery) -> Result<ObjectHandle, Error> {
        let cache_key = (query.clone(), self.slot);
        if let Some(handle) = self.cache.get(&cache_key) {
            return Ok(*handle);
        }

        let handles = self.find_all(query)?;
        let handle = match handles.as_slice() {
            [] => return Err(Error::NotFound(format!("no {} in slot {}", query, self.slot))),
            [handle] => *handle,
            _ => {
                return Err(Error::AmbiguousMatch(format!(
                    "{} objects match {} in slot {}",
                    handles.len(),
                    query,
                    self.slot
                )));
            }
        };

        trace!("Resolved {} to handle {}", query, handle);
        self.cache.insert(cache_key, handle);
        Ok(handle)
    }

    /// Find every object matching the query. Results are not cached.
    pub fn find_all(&self, query: &KeyQuery) -> Result<Vec<ObjectHandle>, Error> {
        self.session
            .find_objects(&query.template())
            .map_err(|err| Error::token(format!("find {}", query), err))
    }

    pub fn invalidate(&mut self, query: &KeyQuery) {
        self.cache.remove(&(query.clone(), self.slot));
    }

    /// Run an operation on the object matching the query.
    ///
    /// If the module reports the handle as invalid the object is looked up again, once, and the operation repeated.
    pub fn with_object<T, F>(&mut self, desc: &str, query: &KeyQuery, mut op: F) -> Result<T, Error>
    where
        F: FnMut(&dyn TokenSession, ObjectHandle) -> Result<T, TokenError>,
    {
        let handle = self.find_one(query)?;
        match op(self.session, handle) {
            Err(TokenError::ObjectHandleInvalid(msg)) => {
                debug!("Handle {} for {} went stale ({}), resolving again", handle, query, msg);
                self.invalidate(query);
                let handle = self.find_one(query)?;
                op(self.session, handle).map_err(|err| Error::token(desc, err))
            }
            res => res.map_err(|err| Error::token(desc, err)),
        }
    }
}
