use crate::error::DomainError;

/// One element of a component path: a name with an optional array index,
/// e.g. `door[2]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSegment {
    pub name: String,
    pub index: Option<usize>,
}

/// Parse a dotted component path such as `a.b[2].c`.
///
/// Grammar: `part ('.' part)*` where `part := name ('[' digits ']')?`.
/// Names are non-empty, indices non-negative. Whitespace around parts and
/// inside the brackets is ignored. An empty path yields an empty segment
/// list (the implicit root).
pub fn parse_path(path: &str) -> Result<Vec<PathSegment>, DomainError> {
    let bad = |message: &str| DomainError::BadPath {
        path: path.to_string(),
        message: message.to_string(),
    };

    if path.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut segments = Vec::new();
    for part in path.split('.') {
        let part = part.trim();
        let (name, index) = match part.split_once('[') {
            None => (part, None),
            Some((name, rest)) => {
                let Some(digits) = rest.strip_suffix(']') else {
                    return Err(bad("invalid array element syntax"));
                };
                let index: usize = digits
                    .trim()
                    .parse()
                    .map_err(|_| bad("invalid array index"))?;
                (name.trim_end(), Some(index))
            }
        };
        if name.is_empty() {
            return Err(bad("empty path element"));
        }
        segments.push(PathSegment {
            name: name.to_string(),
            index,
        });
    }
    Ok(segments)
}
