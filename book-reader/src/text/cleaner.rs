//! Text normalization before chunking and synthesis.

/// Typographic characters and their plain replacements.
const PROBLEMATIC_CHARS: &[(char, &str)] = &[
    ('\u{2018}', "'"),   // Left single quote
    ('\u{2019}', "'"),   // Right single quote
    ('\u{201c}', "\""),  // Left double quote
    ('\u{201d}', "\""),  // Right double quote
    ('\u{2013}', "-"),   // En dash
    ('\u{2014}', "-"),   // Em dash
    ('\u{2026}', "..."), // Ellipsis
    ('\u{200b}', ""),    // Zero-width space
    ('\u{200c}', ""),    // Zero-width non-joiner
    ('\u{200d}', ""),    // Zero-width joiner
    ('\u{2060}', ""),    // Word joiner
    ('\u{00ad}', ""),    // Soft hyphen
    ('\u{feff}', ""),    // BOM
    ('\u{2011}', "-"),   // Non-breaking hyphen
    ('\u{2012}', "-"),   // Figure dash
    ('\u{2015}', "-"),   // Horizontal bar
    ('\u{2032}', "'"),   // Prime (feet)
    ('\u{2033}', "\""),  // Double prime (inches)
    ('\u{2039}', "'"),   // Single left-pointing angle quote
    ('\u{203a}', "'"),   // Single right-pointing angle quote
    ('\u{00ab}', "\""),  // Left-pointing double angle quote
    ('\u{00bb}', "\""),  // Right-pointing double angle quote
];

/// Markup and symbol characters the voice service reads out literally.
const UNWANTED_CHARS: &[char] = &[
    '<', '>', '[', ']', '{', '}', '|', '\\', '/', '@', '#', '$', '%', '^', '&', '*', '_', '+',
    '=', '~',
];

/// Normalize raw text into speakable text.
///
/// This function:
/// - Replaces typographic quotes, dashes and ellipses with plain ASCII
/// - Removes invisible, control, and markup characters
/// - Collapses every whitespace run (newlines included) into one space
/// - Collapses runs of periods, which produce noise in most voices
///
/// `normalize(normalize(x)) == normalize(x)`, and the result never has more
/// characters than the input.
pub fn normalize(text: &str) -> String {
    let mut filtered = String::with_capacity(text.len());

    for c in text.chars() {
        let replacement = PROBLEMATIC_CHARS
            .iter()
            .find(|(ch, _)| *ch == c)
            .map(|(_, r)| *r);

        if let Some(r) = replacement {
            filtered.push_str(r);
        } else if is_allowed_char(c) {
            filtered.push(c);
        }
    }

    let collapsed = collapse_whitespace(&filtered);
    fix_multiple_periods(&collapsed)
}

/// Check if a character survives normalization.
fn is_allowed_char(c: char) -> bool {
    // Whitespace is kept here and collapsed later; '\n' is also a control char
    if c.is_whitespace() {
        return true;
    }

    if c.is_control() || is_invisible(c) {
        return false;
    }

    !UNWANTED_CHARS.contains(&c)
}

/// Format characters, variation selectors, and private-use code points.
///
/// None of these are spoken; bidi controls also reorder what the engine sees.
fn is_invisible(c: char) -> bool {
    matches!(
        c,
        '\u{0600}'..='\u{0605}'
            | '\u{061c}'
            | '\u{06dd}'
            | '\u{070f}'
            | '\u{180e}'
            | '\u{200b}'..='\u{200f}'
            | '\u{202a}'..='\u{202e}'
            | '\u{2060}'..='\u{2064}'
            | '\u{2066}'..='\u{206f}'
            | '\u{e000}'..='\u{f8ff}'
            | '\u{fe00}'..='\u{fe0f}'
            | '\u{feff}'
            | '\u{fff9}'..='\u{fffb}'
            | '\u{e0000}'..='\u{e007f}'
            | '\u{e0100}'..='\u{e01ef}'
            | '\u{f0000}'..='\u{10ffff}'
    )
}

/// Collapse whitespace runs to a single space and trim the ends.
fn collapse_whitespace(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut prev_was_space = false;

    for c in text.chars() {
        if c.is_whitespace() {
            if !prev_was_space {
                result.push(' ');
                prev_was_space = true;
            }
        } else {
            prev_was_space = false;
            result.push(c);
        }
    }

    result.trim().to_string()
}

/// Replace multiple consecutive periods with a single period.
fn fix_multiple_periods(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut prev_was_period = false;

    for c in text.chars() {
        if c == '.' {
            if !prev_was_period {
                result.push('.');
            }
            prev_was_period = true;
        } else {
            prev_was_period = false;
            result.push(c);
        }
    }

    result
}
