//! Keystroke decoding for interactive sessions.

/// Erase the character left of the cursor.
pub const ERASE: &str = "\x08 \x08";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrow {
    Up,
    Down,
    Right,
    Left,
}

impl Arrow {
    pub fn sequence(self) -> &'static str {
        match self {
            Arrow::Up => "\x1b[A",
            Arrow::Down => "\x1b[B",
            Arrow::Right => "\x1b[C",
            Arrow::Left => "\x1b[D",
        }
    }
}

/// One decoded keystroke or pasted run of text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key {
    Enter,
    Backspace,
    Tab,
    Interrupt,
    Arrow(Arrow),
    Text(String),
    /// Control input with no meaning here.
    Ignored(String),
}

impl Key {
    /// Decodes a chunk that holds exactly one key.
    pub fn decode(chunk: &str) -> Key {
        match chunk {
            "\r" | "\n" | "\r\n" => Key::Enter,
            "\x7f" | "\x08" => Key::Backspace,
            "\t" => Key::Tab,
            "\x03" => Key::Interrupt,
            "\x1b[A" => Key::Arrow(Arrow::Up),
            "\x1b[B" => Key::Arrow(Arrow::Down),
            "\x1b[C" => Key::Arrow(Arrow::Right),
            "\x1b[D" => Key::Arrow(Arrow::Left),
            text if !text.is_empty() && !text.chars().any(char::is_control) => {
                Key::Text(text.to_string())
            }
            other => Key::Ignored(other.to_string()),
        }
    }
}

/// Splits a chunk into keys: escape sequences and control characters stand
/// alone, printable runs stay together.
pub fn split_keys(chunk: &str) -> Vec<Key> {
    let mut keys = Vec::new();
    let mut text = String::new();
    let mut chars = chunk.chars().peekable();

    while let Some(c) = chars.next() {
        if !c.is_control() {
            text.push(c);
            continue;
        }
        if !text.is_empty() {
            keys.push(Key::Text(std::mem::take(&mut text)));
        }
        match c {
            '\x1b' => {
                let mut sequence = String::from(c);
                if chars.peek() == Some(&'[') {
                    sequence.push('[');
                    chars.next();
                    if let Some(final_byte) = chars.next() {
                        sequence.push(final_byte);
                    }
                }
                keys.push(Key::decode(&sequence));
            }
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                keys.push(Key::Enter);
            }
            other => keys.push(Key::decode(other.encode_utf8(&mut [0; 4]))),
        }
    }
    if !text.is_empty() {
        keys.push(Key::Text(text));
    }
    keys
}
