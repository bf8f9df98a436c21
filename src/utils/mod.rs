mod byte_cursor;
pub(crate) mod bytes;
mod utf16;
mod windows;

pub use self::byte_cursor::ByteCursor;
pub use self::windows::format_timestamp;
pub(crate) use self::windows::filetime_to_timestamp;
