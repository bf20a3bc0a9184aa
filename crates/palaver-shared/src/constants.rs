/// Application name
pub const APP_NAME: &str = "Palaver";

/// Maximum message text length, counted in characters after trimming
pub const MAX_TEXT_CHARS: usize = 2000;

/// Maximum length of an image reference (URL) in bytes
pub const MAX_IMAGE_REF_BYTES: usize = 2048;

/// Maximum size of a single reaction emoji in bytes (covers ZWJ sequences)
pub const MAX_EMOJI_BYTES: usize = 32;

/// Username length bounds
pub const MIN_USERNAME_LEN: usize = 3;
pub const MAX_USERNAME_LEN: usize = 24;

/// Maximum profile status text length in characters
pub const MAX_STATUS_CHARS: usize = 140;

/// Status text given to newly provisioned users
pub const DEFAULT_STATUS: &str = "Hey there! I am using ChatApp.";

/// Maximum number of messages returned by a history query
pub const HISTORY_LIMIT: u32 = 2000;

/// Prefix of every pairing channel name
pub const PAIRING_PREFIX: &str = "dm";

/// Default HTTP port
pub const DEFAULT_HTTP_PORT: u16 = 5000;
