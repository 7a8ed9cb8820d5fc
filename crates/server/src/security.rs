use serde_json::Value;

/// Bounded JSON parser for upstream bodies we do not control.
#[derive(Debug, Clone, Copy)]
pub struct BoundedBodyParser {
    max_size: usize,
    max_depth: usize,
    max_string_length: usize,
    max_array_length: usize,
    max_object_keys: usize,
}

impl Default for BoundedBodyParser {
    fn default() -> Self {
        Self {
            max_size: 64 * 1024,         // callback bodies are tiny
            max_depth: 16,
            max_string_length: 8 * 1024,
            max_array_length: 1_000,
            max_object_keys: 256,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BodyLimitError {
    #[error("body too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },
    #[error("JSON too deep: {depth} levels (max: {max})")]
    TooDeep { depth: usize, max: usize },
    #[error("string too long: {length} chars (max: {max})")]
    StringTooLong { length: usize, max: usize },
    #[error("array too large: {length} elements (max: {max})")]
    ArrayTooLarge { length: usize, max: usize },
    #[error("object has too many keys: {count} (max: {max})")]
    TooManyKeys { count: usize, max: usize },
    #[error("body is not JSON: {0}")]
    NotJson(#[from] serde_json::Error),
}

impl BoundedBodyParser {
    /// Reject bodies over the size limit before anything looks at them.
    pub fn check_size(&self, data: &[u8]) -> Result<(), BodyLimitError> {
        if data.len() > self.max_size {
            return Err(BodyLimitError::TooLarge {
                size: data.len(),
                max: self.max_size,
            });
        }
        Ok(())
    }

    /// Parse JSON from bytes with size and structure limits
    pub fn parse_json(&self, data: &[u8]) -> Result<Value, BodyLimitError> {
        self.check_size(data)?;
        let value: Value = serde_json::from_slice(data)?;
        self.validate_structure(&value, 0)?;
        Ok(value)
    }

    fn validate_structure(&self, value: &Value, depth: usize) -> Result<(), BodyLimitError> {
        if depth > self.max_depth {
            return Err(BodyLimitError::TooDeep {
                depth,
                max: self.max_depth,
            });
        }

        match value {
            Value::String(s) => {
                if s.len() > self.max_string_length {
                    return Err(BodyLimitError::StringTooLong {
                        length: s.len(),
                        max: self.max_string_length,
                    });
                }
            }
            Value::Array(arr) => {
                if arr.len() > self.max_array_length {
                    return Err(BodyLimitError::ArrayTooLarge {
                        length: arr.len(),
                        max: self.max_array_length,
                    });
                }
                for item in arr {
                    self.validate_structure(item, depth + 1)?;
                }
            }
            Value::Object(obj) => {
                if obj.len() > self.max_object_keys {
                    return Err(BodyLimitError::TooManyKeys {
                        count: obj.len(),
                        max: self.max_object_keys,
                    });
                }
                for (key, val) in obj {
                    if key.len() > self.max_string_length {
                        return Err(BodyLimitError::StringTooLong {
                            length: key.len(),
                            max: self.max_string_length,
                        });
                    }
                    self.validate_structure(val, depth + 1)?;
                }
            }
            _ => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_limit() {
        let large = "\"".to_string() + &"a".repeat(128 * 1024) + "\"";
        let result = BoundedBodyParser::default().parse_json(large.as_bytes());
        assert!(matches!(result, Err(BodyLimitError::TooLarge { .. })));
    }

    #[test]
    fn test_depth_limit() {
        let mut deep_json = String::new();
        for _ in 0..20 {
            deep_json.push_str("{\"a\":");
        }
        deep_json.push('1');
        for _ in 0..20 {
            deep_json.push('}');
        }

        let result = BoundedBodyParser::default().parse_json(deep_json.as_bytes());
        assert!(matches!(result, Err(BodyLimitError::TooDeep { .. })));
    }

    #[test]
    fn test_plain_text_is_not_json() {
        let result = BoundedBodyParser::default().parse_json(b"verification success");
        assert!(matches!(result, Err(BodyLimitError::NotJson(_))));
    }

    #[test]
    fn test_valid_json() {
        let json = r#"{"status": "success", "message": "ok"}"#;
        assert!(BoundedBodyParser::default().parse_json(json.as_bytes()).is_ok());
    }
}
