//! Crate-level error types.
//!
//! Only structurally broken route definitions, malformed inbound payloads,
//! unknown routes and bad configuration surface as errors. Runtime failures
//! inside a live connection (unknown action, expired tab, full queue,
//! panicking handler) are reported through outcomes and logs instead, so
//! they never take a connection down.

/// Error returned while building a [`Composition`](crate::Composition) or
/// an [`App`](crate::App).
///
/// Every variant is a programming error in the route definition. These are
/// raised at setup time and never at request time.
#[derive(Debug, thiserror::Error)]
pub enum CompositionError {
    /// A state or signal was declared after the view function was set.
    ///
    /// Connection stores are seeded from the catalog exactly once, so a late
    /// declaration would be invisible to tabs that already exist.
    #[error("composition '{composition}' is finalized: cannot declare '{key}' after the view")]
    Finalized {
        /// Id of the composition being built.
        composition: String,
        /// Id of the rejected declaration.
        key: String,
    },

    /// The view function was set twice.
    #[error("composition '{composition}' already has a view function")]
    ViewAlreadySet {
        /// Id of the composition being built.
        composition: String,
    },

    /// `build` was called without a view function.
    #[error("composition '{composition}' has no view function")]
    MissingView {
        /// Id of the composition being built.
        composition: String,
    },

    /// Two declarations of the same kind share an id somewhere in the
    /// merged component tree.
    #[error("duplicate {kind} '{key}' in composition '{composition}'")]
    Duplicate {
        /// Id of the composition that received the duplicate.
        composition: String,
        /// `"state"`, `"signal"`, `"action"` or `"component"`.
        kind: &'static str,
        /// The clashing id.
        key: String,
    },

    /// An initial value could not be converted to its stored form.
    #[error("initial value for '{key}' could not be encoded: {source}")]
    Encode {
        /// Id of the declaration.
        key: String,
        /// Underlying serialization failure.
        #[source]
        source: serde_json::Error,
    },

    /// Two pages were registered on the same route.
    #[error("route '{0}' is registered more than once")]
    DuplicateRoute(String),

    /// A page route does not start with `/` or collides with a transport
    /// endpoint.
    #[error("route '{0}' is not a valid page route")]
    InvalidRoute(String),

    /// A composition built with [`Composition::component`] was registered
    /// as a page.
    ///
    /// [`Composition::component`]: crate::Composition::component
    #[error("composition '{composition}' has no route")]
    MissingRoute {
        /// Id of the composition.
        composition: String,
    },
}

/// Error returned when an inbound action payload cannot be decoded.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    /// The payload is not valid JSON.
    #[error("malformed action payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The payload is valid JSON but not an object.
    #[error("action payload must be a JSON object")]
    NotAnObject,

    /// The reserved connection id key is missing or not a string.
    #[error("action payload has no connection id")]
    MissingConnectionId,
}

/// Error returned when rendering the initial page for a new tab fails.
#[derive(Debug, thiserror::Error)]
pub enum PageError {
    /// No page is registered on the requested route.
    #[error("no page registered on route '{0}'")]
    UnknownRoute(String),

    /// The page view panicked during the initial render.
    #[error("view for route '{route}' panicked during render")]
    ViewPanicked {
        /// Route whose view panicked.
        route: String,
    },
}

/// Error returned when configuration values are out of range or unparsable.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable holds a value that cannot be used.
    #[error("invalid value '{value}' for {var}: {reason}")]
    Invalid {
        /// Name of the variable.
        var: &'static str,
        /// The raw value found.
        value: String,
        /// Why it was rejected.
        reason: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalized_display_names_composition_and_key() {
        let err = CompositionError::Finalized {
            composition: "counter".to_string(),
            key: "count".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "composition 'counter' is finalized: cannot declare 'count' after the view"
        );
    }

    #[test]
    fn duplicate_display_includes_kind() {
        let err = CompositionError::Duplicate {
            composition: "page".to_string(),
            kind: "signal",
            key: "name".to_string(),
        };
        assert_eq!(err.to_string(), "duplicate signal 'name' in composition 'page'");
    }

    #[test]
    fn payload_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err = PayloadError::from(json_err);
        assert!(err.to_string().starts_with("malformed action payload"));
    }

    #[test]
    fn config_error_display() {
        let err = ConfigError::Invalid {
            var: "TABSYNC_PATCH_QUEUE_CAPACITY",
            value: "0".to_string(),
            reason: "must be at least 1",
        };
        assert_eq!(
            err.to_string(),
            "invalid value '0' for TABSYNC_PATCH_QUEUE_CAPACITY: must be at least 1"
        );
    }

    // Errors cross task boundaries (spawn_blocking, axum handlers).
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<CompositionError>();
            assert_send_sync::<PayloadError>();
            assert_send_sync::<PageError>();
            assert_send_sync::<ConfigError>();
        }
    };
}
