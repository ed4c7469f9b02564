/// Parses a progress marker of the form `captured: <n>`.
///
/// The key is matched case-insensitively and surrounding whitespace is
/// ignored. Anything that is not a non-negative integer yields `None`.
pub fn parse_progress(line: &str) -> Option<u32> {
    let (key, rest) = line.split_once(':')?;
    if !key.trim().eq_ignore_ascii_case("captured") {
        return None;
    }
    let value = rest.split(':').next()?;
    value.trim().parse().ok()
}
