use devicehub_protocol::action::RequestData;
use devicehub_protocol::{ActionType, Request, Response};

use super::Action;
use crate::error::Result;

/// Free-form request understood by app-specific agent extensions
#[derive(Debug, Clone, Default)]
pub struct Custom {
    pub request_data: String,
    pub content: Vec<u8>,
    pub success: bool,
}

impl Custom {
    pub fn new(request_data: impl Into<String>) -> Self {
        Self {
            request_data: request_data.into(),
            ..Default::default()
        }
    }
}

impl Action for Custom {
    fn action_type(&self) -> ActionType {
        ActionType::Custom
    }

    fn request(&self) -> Request {
        Request::with_payload(
            ActionType::Custom,
            RequestData {
                data: Some(self.request_data.as_bytes().to_vec()),
                ..Default::default()
            },
        )
    }

    fn process_response(&mut self, response: &Response) -> Result<()> {
        self.content = response.payload.data.clone().unwrap_or_default();
        self.success = response.success;
        Ok(())
    }
}
