use std::io;

/// Decodes a value out of one received frame body.
///
/// The value may borrow from `buf`, as `Msg::Err` does for its text.
pub trait Deserialize<'a>: Sized {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self>;
}
