//! Utility functions.

/// Aligns an address or size up to the next multiple of `align`.
/// `align` must be a power of two.
pub fn align_up(addr: u64, align: u64) -> u64 {
    assert!(align.is_power_of_two());
    (addr + align - 1) & !(align - 1)
}

/// Rewrites `name` into a valid C identifier: the first character
/// must be alphabetic and the rest alphanumeric, with everything
/// else becoming an underscore.
pub fn sanitize_identifier(name: &str) -> String {
    let mut chars = name.chars();
    let first = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => c,
        _ => '_',
    };
    let mut identifier = String::with_capacity(name.len().max(1));
    identifier.push(first);
    for c in chars {
        identifier.push(if c.is_ascii_alphanumeric() { c } else { '_' });
    }
    identifier
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_the_next_multiple() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(0x1001, 0x1000), 0x2000);
    }

    #[test]
    fn identifiers_keep_only_alphanumerics() {
        assert_eq!(sanitize_identifier("hello"), "hello");
        assert_eq!(sanitize_identifier("99bottles"), "_9bottles");
        assert_eq!(sanitize_identifier("foo-bar.baz"), "foo_bar_baz");
        assert_eq!(sanitize_identifier("_start"), "_start");
        assert_eq!(sanitize_identifier(""), "_");
    }
}
