pub trait Serialize<'a> {
    /// Writes the owned part of `self` into `buf`.
    ///
    /// Returns a borrowed slice that must be written right after `buf`, if any.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]>;
}
