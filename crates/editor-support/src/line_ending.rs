//! Newline conventions of stored content.
//!
//! A [`Document`](crate::Document) always holds LF text. Content read from a
//! [`ContentSource`](crate::ContentSource) goes through [`LineEnding::split_text`], which strips
//! CRLF pairs in one pass and reports the convention it found; [`LineEnding::encode`] turns the
//! buffer back into bytes in that convention when saving.

/// Newline convention of a content source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LineEnding {
    /// `"\n"`.
    #[default]
    Lf,
    /// `"\r\n"`.
    Crlf,
}

impl LineEnding {
    /// The newline sequence.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lf => "\n",
            Self::Crlf => "\r\n",
        }
    }

    /// Turn freshly read text into buffer text.
    ///
    /// Any CRLF pair makes the content [`Crlf`](Self::Crlf); every pair becomes a single LF.
    /// Lone `'\r'` characters are kept as they are.
    pub fn split_text(text: String) -> (Self, String) {
        if !text.contains("\r\n") {
            return (Self::Lf, text);
        }

        let mut buffer = String::with_capacity(text.len());
        let mut rest = text.as_str();
        while let Some(at) = rest.find("\r\n") {
            buffer.push_str(&rest[..at]);
            buffer.push('\n');
            rest = &rest[at + 2..];
        }
        buffer.push_str(rest);
        (Self::Crlf, buffer)
    }

    /// Bytes to store for the buffer text `text`.
    pub fn encode(self, text: &str) -> Vec<u8> {
        if self == Self::Lf {
            return text.as_bytes().to_vec();
        }

        let breaks = text.matches('\n').count();
        let mut bytes = Vec::with_capacity(text.len() + breaks);
        for (i, line) in text.split('\n').enumerate() {
            if i > 0 {
                bytes.extend_from_slice(self.as_str().as_bytes());
            }
            bytes.extend_from_slice(line.as_bytes());
        }
        bytes
    }
}
