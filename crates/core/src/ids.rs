#![forbid(unsafe_code)]

const MAX_ID_LEN: usize = 128;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntityIdError {
    Empty,
    TooLong,
    InvalidFirstChar,
    InvalidChar { ch: char, index: usize },
}

impl EntityIdError {
    pub fn message(&self) -> &'static str {
        match self {
            Self::Empty => "id must not be empty",
            Self::TooLong => "id is too long",
            Self::InvalidFirstChar => "id must start with an ascii letter or digit",
            Self::InvalidChar { .. } => "id contains an unsupported character",
        }
    }
}

/// Ids are what the remote backend accepts as primary keys: an ascii
/// alphanumeric first character followed by alphanumerics or `.` `_` `-` `:`.
pub fn validate_entity_id(value: &str) -> Result<(), EntityIdError> {
    if value.is_empty() {
        return Err(EntityIdError::Empty);
    }
    if value.len() > MAX_ID_LEN {
        return Err(EntityIdError::TooLong);
    }
    let mut chars = value.chars();
    let Some(first) = chars.next() else {
        return Err(EntityIdError::Empty);
    };
    if !first.is_ascii_alphanumeric() {
        return Err(EntityIdError::InvalidFirstChar);
    }
    for (index, ch) in value.chars().enumerate().skip(1) {
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-' | ':') {
            continue;
        }
        return Err(EntityIdError::InvalidChar { ch, index });
    }
    Ok(())
}
