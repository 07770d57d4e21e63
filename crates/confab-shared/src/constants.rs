/// Separator between the two user ids of a canonical room id (`"3_7"`)
pub const ROOM_ID_SEPARATOR: char = '_';

/// Hard ceiling on the number of messages returned by one page
pub const MAX_PAGE_LIMIT: u32 = 200;

/// Default number of characters kept in a last-message preview
pub const DEFAULT_PREVIEW_CHARS: usize = 100;

/// Maximum message body size in bytes (64 KiB)
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// Maximum group name length in characters
pub const MAX_GROUP_NAME_CHARS: usize = 100;

/// Maximum client idempotency token length in bytes
pub const MAX_CLIENT_TOKEN_BYTES: usize = 128;

/// Preview shown for image messages
pub const IMAGE_PREVIEW: &str = "[image]";

/// Preview shown for file messages
pub const FILE_PREVIEW: &str = "[file]";
