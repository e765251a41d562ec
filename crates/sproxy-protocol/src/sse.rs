use serde::Serialize;

pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// One `data: <json>\n\n` frame.
pub fn data_frame<T: Serialize>(value: &T) -> String {
    match serde_json::to_string(value) {
        Ok(json) => format!("data: {json}\n\n"),
        // Serialization of our own wire types cannot fail; keep the stream
        // well-formed if it ever does.
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_is_terminated_by_blank_line() {
        let frame = data_frame(&serde_json::json!({"a": 1}));
        assert_eq!(frame, "data: {\"a\":1}\n\n");
    }

    #[test]
    fn done_frame_shape() {
        assert_eq!(DONE_FRAME, "data: [DONE]\n\n");
    }
}
