//! Translation of boot commands into PC keyboard scancodes (set 1).
//!
//! A boot command is plain text with a few bracketed tokens: `<enter>`, `<esc>`, `<tab>`,
//! `<bs>`, `<spacebar>` and `<wait>` (one second) or `<waitN>` (N seconds). A `<` that does not
//! start a known token is typed literally.

use std::time::Duration;

use crate::{VboxcoreError, VboxcoreResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const BREAK_BIT: u8 = 0x80;
const LEFT_SHIFT: u8 = 0x2a;
const ESC: u8 = 0x01;
const BACKSPACE: u8 = 0x0e;
const TAB: u8 = 0x0f;
const ENTER: u8 = 0x1c;
const SPACE: u8 = 0x39;

const WAIT_UNIT: Duration = Duration::from_secs(1);

/// Unshifted US layout: character, make code.
const PLAIN_KEYS: &[(char, u8)] = &[
    ('1', 0x02),
    ('2', 0x03),
    ('3', 0x04),
    ('4', 0x05),
    ('5', 0x06),
    ('6', 0x07),
    ('7', 0x08),
    ('8', 0x09),
    ('9', 0x0a),
    ('0', 0x0b),
    ('-', 0x0c),
    ('=', 0x0d),
    ('q', 0x10),
    ('w', 0x11),
    ('e', 0x12),
    ('r', 0x13),
    ('t', 0x14),
    ('y', 0x15),
    ('u', 0x16),
    ('i', 0x17),
    ('o', 0x18),
    ('p', 0x19),
    ('[', 0x1a),
    (']', 0x1b),
    ('a', 0x1e),
    ('s', 0x1f),
    ('d', 0x20),
    ('f', 0x21),
    ('g', 0x22),
    ('h', 0x23),
    ('j', 0x24),
    ('k', 0x25),
    ('l', 0x26),
    (';', 0x27),
    ('\'', 0x28),
    ('`', 0x29),
    ('\\', 0x2b),
    ('z', 0x2c),
    ('x', 0x2d),
    ('c', 0x2e),
    ('v', 0x2f),
    ('b', 0x30),
    ('n', 0x31),
    ('m', 0x32),
    (',', 0x33),
    ('.', 0x34),
    ('/', 0x35),
    (' ', SPACE),
    ('\t', TAB),
    ('\n', ENTER),
];

/// Shifted characters and the unshifted key producing them.
const SHIFTED_KEYS: &[(char, char)] = &[
    ('!', '1'),
    ('@', '2'),
    ('#', '3'),
    ('$', '4'),
    ('%', '5'),
    ('^', '6'),
    ('&', '7'),
    ('*', '8'),
    ('(', '9'),
    (')', '0'),
    ('_', '-'),
    ('+', '='),
    ('{', '['),
    ('}', ']'),
    (':', ';'),
    ('"', '\''),
    ('~', '`'),
    ('|', '\\'),
    ('<', ','),
    ('>', '.'),
    ('?', '/'),
];

const SPECIAL_KEYS: &[(&str, u8)] = &[
    ("enter", ENTER),
    ("return", ENTER),
    ("esc", ESC),
    ("tab", TAB),
    ("bs", BACKSPACE),
    ("spacebar", SPACE),
];

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One step of a typed boot command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyAction {
    /// Scancodes to send, make and break codes interleaved.
    Scancodes(Vec<u8>),

    /// A pause before the next keystrokes.
    Wait(Duration),
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Encodes a boot command into scancode batches and pauses.
pub fn encode(command: &str) -> VboxcoreResult<Vec<KeyAction>> {
    let mut actions = Vec::new();
    let mut codes = Vec::new();
    let mut rest = command;

    while let Some(c) = rest.chars().next() {
        if c == '<' {
            if let Some((token, after)) = parse_token(rest) {
                match token {
                    Token::Key(code) => press(&mut codes, code, false),
                    Token::Wait(duration) => {
                        if !codes.is_empty() {
                            actions.push(KeyAction::Scancodes(std::mem::take(&mut codes)));
                        }
                        actions.push(KeyAction::Wait(duration));
                    }
                }
                rest = after;
                continue;
            }
        }

        let (code, shift) = char_code(c).ok_or_else(|| {
            VboxcoreError::Catalogue(format!("boot command contains untypeable character {c:?}"))
        })?;
        press(&mut codes, code, shift);
        rest = &rest[c.len_utf8()..];
    }

    if !codes.is_empty() {
        actions.push(KeyAction::Scancodes(codes));
    }

    Ok(actions)
}

enum Token {
    Key(u8),
    Wait(Duration),
}

fn parse_token(input: &str) -> Option<(Token, &str)> {
    let close = input.find('>')?;
    let name = input[1..close].to_ascii_lowercase();
    let after = &input[close + 1..];

    if let Some((_, code)) = SPECIAL_KEYS.iter().find(|(key, _)| *key == name) {
        return Some((Token::Key(*code), after));
    }

    let count = name.strip_prefix("wait")?;
    let count = if count.is_empty() {
        1
    } else {
        count.parse::<u32>().ok()?
    };

    Some((Token::Wait(WAIT_UNIT * count), after))
}

fn char_code(c: char) -> Option<(u8, bool)> {
    if c.is_ascii_uppercase() {
        return plain_code(c.to_ascii_lowercase()).map(|code| (code, true));
    }

    if let Some(code) = plain_code(c) {
        return Some((code, false));
    }

    SHIFTED_KEYS
        .iter()
        .find(|(shifted, _)| *shifted == c)
        .and_then(|(_, base)| plain_code(*base))
        .map(|code| (code, true))
}

fn plain_code(c: char) -> Option<u8> {
    PLAIN_KEYS
        .iter()
        .find(|(key, _)| *key == c)
        .map(|(_, code)| *code)
}

fn press(codes: &mut Vec<u8>, code: u8, shift: bool) {
    if shift {
        codes.push(LEFT_SHIFT);
    }

    codes.push(code);
    codes.push(code | BREAK_BIT);

    if shift {
        codes.push(LEFT_SHIFT | BREAK_BIT);
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_plain_and_shifted_characters() -> anyhow::Result<()> {
        assert_eq!(
            encode("aB")?,
            vec![KeyAction::Scancodes(vec![0x1e, 0x9e, 0x2a, 0x30, 0xb0, 0xaa])]
        );

        assert_eq!(
            encode("a:")?,
            vec![KeyAction::Scancodes(vec![0x1e, 0x9e, 0x2a, 0x27, 0xa7, 0xaa])]
        );

        Ok(())
    }

    #[test]
    fn test_encode_tokens_and_waits() -> anyhow::Result<()> {
        assert_eq!(
            encode("<esc><wait>x<wait3><enter>")?,
            vec![
                KeyAction::Scancodes(vec![0x01, 0x81]),
                KeyAction::Wait(Duration::from_secs(1)),
                KeyAction::Scancodes(vec![0x2d, 0xad]),
                KeyAction::Wait(Duration::from_secs(3)),
                KeyAction::Scancodes(vec![0x1c, 0x9c]),
            ]
        );

        Ok(())
    }

    #[test]
    fn test_encode_literal_angle_bracket() -> anyhow::Result<()> {
        assert_eq!(
            encode("<x")?,
            vec![KeyAction::Scancodes(vec![
                0x2a, 0x33, 0xb3, 0xaa, 0x2d, 0xad
            ])]
        );

        Ok(())
    }

    #[test]
    fn test_encode_rejects_untypeable_characters() {
        assert!(encode("café").is_err());
        assert!(encode("a\u{7}").is_err());
    }
}
