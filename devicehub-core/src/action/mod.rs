//! Typed device actions.
//!
//! Every action knows how to build its request envelope and how to read its
//! typed result back out of the agent's response. Response type mismatches are
//! rejected before an action looks at the payload.

mod custom;
mod element;
mod screenshot;
mod test_run;
mod touch;

pub use custom::Custom;
pub use element::{DragAndDrop, GetValue, IsDisplayed, LongTouchElement, SetValue, TouchElement};
pub use screenshot::{image_dimensions, GetSceneGraph, GetScreenshot};
pub use test_run::{TestStart, TestsGet, UnityReset};
pub use touch::{Scroll, TouchPosition};

use devicehub_protocol::{ActionType, Request, Response};

use crate::error::{HubError, Result};

pub trait Action: Send {
    fn action_type(&self) -> ActionType;

    /// Request envelope for this action, without an action id
    fn request(&self) -> Request;

    /// Copy the typed result out of a response of the matching type
    fn process_response(&mut self, response: &Response) -> Result<()>;

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.request().encode()?)
    }

    fn decode(&mut self, bytes: &[u8]) -> Result<()> {
        let response = Response::decode(bytes)?;
        self.accept(&response)
    }

    /// Check the response type, then process it
    fn accept(&mut self, response: &Response) -> Result<()> {
        if response.action_type != self.action_type() {
            return Err(HubError::UnexpectedResponse(format!(
                "expected {} got {}",
                self.action_type(),
                response.action_type
            )));
        }
        self.process_response(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devicehub_protocol::action::ResponseData;

    #[test]
    fn test_decode_rejects_mismatched_type() {
        let mut action = UnityReset::default();
        let bytes = Response::new(ActionType::GetTests, true).encode().unwrap();

        let err = action.decode(&bytes).unwrap_err();
        assert!(matches!(err, HubError::UnexpectedResponse(_)));
        assert!(!action.success);
    }

    #[test]
    fn test_decode_garbage_is_serialization_error() {
        let mut action = IsDisplayed::new("label");
        assert!(matches!(
            action.decode(b"not json"),
            Err(HubError::Serialization(_))
        ));
    }

    #[test]
    fn test_every_action_decodes_success_and_payload() {
        let mut visible = IsDisplayed::new("id");
        let mut response = Response::new(ActionType::ElementIsDisplayed, true);
        response.payload = ResponseData {
            visible: Some(true),
            ..Default::default()
        };
        visible.decode(&response.encode().unwrap()).unwrap();
        assert!(visible.success && visible.visible);

        let mut value = GetValue::new("id", "text");
        let mut response = Response::new(ActionType::ElementGetValue, false);
        response.payload.value = Some("hello".to_string());
        value.decode(&response.encode().unwrap()).unwrap();
        assert!(!value.success);
        assert_eq!(value.value, "hello");

        let mut custom = Custom::new("{\"cmd\":1}");
        let mut response = Response::new(ActionType::Custom, true);
        response.payload.data = Some(b"ok".to_vec());
        custom.decode(&response.encode().unwrap()).unwrap();
        assert_eq!(custom.content, b"ok");

        let mut tests = TestsGet::default();
        let mut response = Response::new(ActionType::GetTests, true);
        response.payload.tests = Some(devicehub_protocol::action::Tests {
            tests: vec![devicehub_protocol::action::Test {
                class: "LoginTests".to_string(),
                method: "CanLogin".to_string(),
                ..Default::default()
            }],
        });
        tests.decode(&response.encode().unwrap()).unwrap();
        assert_eq!(tests.tests.len(), 1);
        assert_eq!(tests.tests[0].method, "CanLogin");

        let mut touch = TouchPosition::up(10, 20);
        touch
            .decode(&Response::new(ActionType::TouchUp, true).encode().unwrap())
            .unwrap();
        assert!(touch.success);
    }
}
