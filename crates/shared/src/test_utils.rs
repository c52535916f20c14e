use std::sync::Once;

use crate::identity::{CredentialSource, IdProvider, Principal, PrincipalType};

pub static INIT_TEST_ONCE: Once = Once::new();

/// One-time per-process test initialization: optional `.env` files and a
/// tracing subscriber so failing tests print their context.
#[macro_export]
macro_rules! setup_test {
    () => {{
        $crate::test_utils::INIT_TEST_ONCE.call_once(|| {
            $crate::env::load_optional_env_files();
            $crate::logging::configure_logging().unwrap();
        });
    }};
}

// ============================================================================
// Test Principal Helpers
// ============================================================================

/// Browser user with the given groups.
pub fn test_session_user(sub: &str, groups: &[&str]) -> Principal {
    Principal {
        sub: sub.to_string(),
        principal_type: PrincipalType::User,
        groups: groups.iter().map(|g| g.to_string()).collect(),
        source: CredentialSource::Session,
        idp: IdProvider::Keycloak,
    }
}

/// Programmatic caller authenticating via `X-Authorization`.
pub fn test_ingress_account(sub: &str, groups: &[&str]) -> Principal {
    Principal {
        sub: sub.to_string(),
        principal_type: PrincipalType::ServiceAccount,
        groups: groups.iter().map(|g| g.to_string()).collect(),
        source: CredentialSource::IngressHeader,
        idp: IdProvider::Cognito,
    }
}

/// Principal carrying the unrestricted execute group.
pub fn test_unrestricted_user(sub: &str) -> Principal {
    test_session_user(sub, &["mcp-servers-unrestricted/execute"])
}
