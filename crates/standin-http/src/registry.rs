//! The endpoint registry: maps an inbound path to at most one endpoint.

use tracing::trace;

use crate::endpoint::Endpoint;
use crate::error::{Result, StandinError};

/// Owns the set of uniquely-named endpoints. Endpoints keep their load order,
/// which makes listings and coverage reports deterministic.
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    endpoints: Vec<Endpoint>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, endpoint: Endpoint) -> Result<()> {
        if self.endpoints.iter().any(|e| e.name() == endpoint.name()) {
            return Err(StandinError::DuplicateName(endpoint.name().to_string()));
        }
        self.endpoints.push(endpoint);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Evaluate every endpoint's path pattern against `path`. No match means
    /// no route; two or more matches is a configuration mistake and fatal.
    /// The check runs lazily at resolution time, not at load time.
    pub fn resolve(&self, path: &str) -> Result<Option<&Endpoint>> {
        let mut hit: Option<&Endpoint> = None;
        for endpoint in &self.endpoints {
            if !endpoint.matches(path) {
                continue;
            }
            match hit {
                None => hit = Some(endpoint),
                Some(first) => {
                    return Err(StandinError::AmbiguousRoute {
                        path: path.to_string(),
                        first: first.name().to_string(),
                        second: endpoint.name().to_string(),
                    });
                }
            }
        }
        if let Some(endpoint) = hit {
            trace!(path, endpoint = endpoint.name(), "route resolved");
        }
        Ok(hit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(name: &str, pattern: &str) -> Endpoint {
        Endpoint::new(name, pattern).unwrap()
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = EndpointRegistry::new();
        registry.add(endpoint("foo", "^/foo")).unwrap();
        assert!(matches!(
            registry.add(endpoint("foo", "^/other")),
            Err(StandinError::DuplicateName(_))
        ));
    }

    #[test]
    fn test_add_then_resolve_by_path() {
        let mut registry = EndpointRegistry::new();
        registry.add(endpoint("foo", "^/foo/")).unwrap();
        let found = registry.resolve("/foo/").unwrap().unwrap();
        assert_eq!(found.name(), "foo");
    }

    #[test]
    fn test_zero_one_many_routing() {
        let mut registry = EndpointRegistry::new();
        registry.add(endpoint("foo", "^/foo/")).unwrap();
        registry.add(endpoint("bar", "^/bar")).unwrap();
        registry.add(endpoint("barista", "^/barista")).unwrap();

        assert_eq!(registry.resolve("/foo/").unwrap().unwrap().name(), "foo");
        assert!(registry.resolve("/kjlkj/").unwrap().is_none());
        // "/barista" is matched by both "^/bar" and "^/barista".
        assert!(matches!(
            registry.resolve("/barista"),
            Err(StandinError::AmbiguousRoute { .. })
        ));
    }
}
