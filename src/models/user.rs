//! Current-user identity as returned by the platform API.

use serde::{Deserialize, Serialize};

/// The authenticated user behind the session token. Used to exclude
/// the user's own typing events from the indicator set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentUser {
    pub username: String,
    #[serde(default)]
    pub role: Option<String>,
}
