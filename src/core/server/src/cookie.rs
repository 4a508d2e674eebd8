// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use protocol_mcbp::RequestHeader;

/// How much of the current packet the cookie has a view of.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketContent {
    None,
    HeaderOnly,
    Full,
}

/// Per-command context bound to a connection. The cookie is owned by its
/// connection and reset between commands rather than reallocated; the packet
/// view stays valid until the state machine consumes the executed bytes on
/// the way back to `new_cmd`.
pub struct Cookie {
    header: Option<RequestHeader>,
    content: PacketContent,
    cas: u64,
    error_context: String,
    event_id: String,
    dynamic_buffer: Vec<u8>,
}

impl Cookie {
    pub fn new() -> Self {
        Self {
            header: None,
            content: PacketContent::None,
            cas: 0,
            error_context: String::new(),
            event_id: String::new(),
            dynamic_buffer: Vec::new(),
        }
    }

    /// Reset for the next command. Buffers keep their capacity.
    pub fn reset(&mut self) {
        self.header = None;
        self.content = PacketContent::None;
        self.cas = 0;
        self.error_context.clear();
        self.event_id.clear();
        self.dynamic_buffer.clear();
    }

    pub fn set_packet(&mut self, header: RequestHeader, content: PacketContent) {
        self.header = Some(header);
        self.content = content;
    }

    pub fn upgrade_to_full(&mut self) {
        debug_assert!(self.header.is_some());
        self.content = PacketContent::Full;
    }

    pub fn header(&self) -> Option<&RequestHeader> {
        self.header.as_ref()
    }

    pub fn content(&self) -> PacketContent {
        self.content
    }

    pub fn cas(&self) -> u64 {
        self.cas
    }

    pub fn set_cas(&mut self, cas: u64) {
        self.cas = cas;
    }

    pub fn set_error_context<T: Into<String>>(&mut self, context: T) {
        self.error_context = context.into();
    }

    pub fn set_event_id<T: Into<String>>(&mut self, id: T) {
        self.event_id = id.into();
    }

    pub fn error_context(&self) -> &str {
        &self.error_context
    }

    /// Render the error body: `{"error":{"context":…,"ref":…}}` with absent
    /// fields omitted, or `None` when there is nothing to report.
    pub fn error_json(&self) -> Option<String> {
        if self.error_context.is_empty() && self.event_id.is_empty() {
            return None;
        }

        let mut error = serde_json::Map::new();
        if !self.error_context.is_empty() {
            error.insert(
                "context".to_string(),
                serde_json::Value::String(self.error_context.clone()),
            );
        }
        if !self.event_id.is_empty() {
            error.insert(
                "ref".to_string(),
                serde_json::Value::String(self.event_id.clone()),
            );
        }

        let mut root = serde_json::Map::new();
        root.insert("error".to_string(), serde_json::Value::Object(error));
        Some(serde_json::Value::Object(root).to_string())
    }

    pub fn dynamic_buffer(&mut self) -> &mut Vec<u8> {
        &mut self.dynamic_buffer
    }

    pub fn take_dynamic_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.dynamic_buffer)
    }
}

impl Default for Cookie {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_json_shapes() {
        let mut cookie = Cookie::new();
        assert_eq!(cookie.error_json(), None);

        cookie.set_error_context("Not found");
        assert_eq!(
            cookie.error_json().unwrap(),
            r#"{"error":{"context":"Not found"}}"#
        );

        cookie.set_event_id("ab12");
        assert_eq!(
            cookie.error_json().unwrap(),
            r#"{"error":{"context":"Not found","ref":"ab12"}}"#
        );

        cookie.reset();
        assert_eq!(cookie.error_json(), None);
    }
}
