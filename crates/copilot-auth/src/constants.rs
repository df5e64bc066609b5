//! GitHub and Copilot endpoint constants
//!
//! The client id is the public OAuth application used by the Copilot editor
//! plugins. It identifies the application, not the user, and is not a secret.

/// Public OAuth client id for the GitHub device flow
pub const GITHUB_CLIENT_ID: &str = "Iv1.b507a08c87ecfe98";

/// Scope requested during device authorization
pub const GITHUB_SCOPE: &str = "read:user";

/// Device code endpoint (step 1 of the device flow)
pub const DEVICE_CODE_URL: &str = "https://github.com/login/device/code";

/// Access token endpoint polled while the user approves the code
pub const ACCESS_TOKEN_URL: &str = "https://github.com/login/oauth/access_token";

/// Grant type sent with every access token poll (RFC 8628)
pub const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Internal endpoint that trades a GitHub token for a Copilot API token
pub const TOKEN_EXCHANGE_URL: &str = "https://api.github.com/copilot_internal/v2/token";

/// Copilot chat API host every proxied request is sent to
pub const COPILOT_API_HOST: &str = "api.individual.githubcopilot.com";

/// User agent presented to GitHub and to the Copilot API
pub const USER_AGENT: &str = "GitHubCopilotChat/0.26.7";

/// Directory under the user's local data dir holding persisted state
pub const DATA_DIR_NAME: &str = "copilot-api-proxy";

/// File name of the persisted GitHub token
pub const TOKEN_FILE_NAME: &str = "github_token";
