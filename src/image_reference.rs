use std::fmt;

/// Registry location of a container image, resolved from a `host/path:tag` descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    MalformedDescriptor(String),
    AmbiguousTag(String),
    DigestNotAllowed,
}

impl std::error::Error for ParseError {}
impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::MalformedDescriptor(image) => {
                write!(f, "malformed image descriptor: {}", image)
            }
            ParseError::AmbiguousTag(image) => write!(
                f,
                "tag of image descriptor {} contains ':' or '/', registry ports are not supported",
                image
            ),
            ParseError::DigestNotAllowed => write!(f, "digest references are not allowed"),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

impl ImageReference {
    /// Splits on the first ':' anywhere in the descriptor, then splits the left
    /// side on its first '/' into registry host and repository path.
    pub fn parse(descriptor: &str) -> Result<Self, ParseError> {
        if descriptor.contains('@') {
            return Err(ParseError::DigestNotAllowed);
        }

        let malformed = || ParseError::MalformedDescriptor(descriptor.to_string());

        let (location, tag) = descriptor.split_once(':').ok_or_else(malformed)?;
        if tag.contains(['/', ':']) {
            return Err(ParseError::AmbiguousTag(descriptor.to_string()));
        }

        let (registry, repository) = location.split_once('/').ok_or_else(malformed)?;
        if registry.is_empty() || repository.is_empty() || tag.is_empty() {
            return Err(malformed());
        }

        Ok(Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag: tag.to_string(),
        })
    }
}
