/// Application name
pub const APP_NAME: &str = "tidings";

/// Identity of the synthetic inbox row that stands in for every administrator
pub const SUPPORT_ID: &str = "platform-support";

/// Display name of the synthetic support row
pub const SUPPORT_DISPLAY_NAME: &str = "Platform Support";

/// Maximum length of a user or group id in bytes
pub const MAX_ID_LEN: usize = 64;

/// Number of messages kept per conversation in the rolling cache
pub const ROLLING_CACHE_CAP: usize = 10;

/// Rolling cache entry lifetime in seconds (refreshed on every write)
pub const ROLLING_CACHE_TTL_SECS: u64 = 3600;

/// Maximum size of a send payload (body + attachment metadata) in bytes (1 MiB)
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Page size used when a request does not name one
pub const DEFAULT_PAGE_LIMIT: usize = 20;

/// Upper bound on any requested page size
pub const MAX_PAGE_LIMIT: usize = 100;

/// Characters kept in an inbox preview
pub const PREVIEW_CHARS: usize = 100;

/// Broadcast bus topic carrying live deliveries
pub const DELIVERY_TOPIC: &str = "tidings:deliveries";

/// Default HTTP API port
pub const DEFAULT_HTTP_PORT: u16 = 8080;
