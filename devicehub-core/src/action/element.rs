use devicehub_protocol::action::{GetAttr, MoveElement, RequestData, SetAttr};
use devicehub_protocol::{ActionType, Request, Response};

use super::Action;
use crate::error::{HubError, Result};

fn element_request(action_type: ActionType, element_id: &str) -> Request {
    Request::with_payload(
        action_type,
        RequestData {
            id: Some(element_id.to_string()),
            ..Default::default()
        },
    )
}

#[derive(Debug, Clone, Default)]
pub struct IsDisplayed {
    pub element_id: String,
    pub visible: bool,
    pub success: bool,
}

impl IsDisplayed {
    pub fn new(element_id: impl Into<String>) -> Self {
        Self {
            element_id: element_id.into(),
            ..Default::default()
        }
    }
}

impl Action for IsDisplayed {
    fn action_type(&self) -> ActionType {
        ActionType::ElementIsDisplayed
    }

    fn request(&self) -> Request {
        element_request(ActionType::ElementIsDisplayed, &self.element_id)
    }

    fn process_response(&mut self, response: &Response) -> Result<()> {
        self.success = response.success;
        self.visible = response.payload.visible.unwrap_or(false);
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SetValue {
    pub element_id: String,
    pub attr: String,
    pub value: String,
    pub success: bool,
}

impl SetValue {
    pub fn new(
        element_id: impl Into<String>,
        attr: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            element_id: element_id.into(),
            attr: attr.into(),
            value: value.into(),
            success: false,
        }
    }
}

impl Action for SetValue {
    fn action_type(&self) -> ActionType {
        ActionType::ElementSetValue
    }

    fn request(&self) -> Request {
        Request::with_payload(
            ActionType::ElementSetValue,
            RequestData {
                set_attr: Some(SetAttr {
                    id: self.element_id.clone(),
                    attr: self.attr.clone(),
                    val: self.value.clone(),
                }),
                ..Default::default()
            },
        )
    }

    fn process_response(&mut self, response: &Response) -> Result<()> {
        self.success = response.success;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct GetValue {
    pub element_id: String,
    pub attr: String,
    pub value: String,
    pub success: bool,
}

impl GetValue {
    pub fn new(element_id: impl Into<String>, attr: impl Into<String>) -> Self {
        Self {
            element_id: element_id.into(),
            attr: attr.into(),
            ..Default::default()
        }
    }
}

impl Action for GetValue {
    fn action_type(&self) -> ActionType {
        ActionType::ElementGetValue
    }

    fn request(&self) -> Request {
        Request::with_payload(
            ActionType::ElementGetValue,
            RequestData {
                get_attr: Some(GetAttr {
                    id: self.element_id.clone(),
                    attr: self.attr.clone(),
                }),
                ..Default::default()
            },
        )
    }

    fn process_response(&mut self, response: &Response) -> Result<()> {
        self.success = response.success;
        self.value = response
            .payload
            .value
            .clone()
            .ok_or_else(|| HubError::UnexpectedResponse("missing value".to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct TouchElement {
    pub element_id: String,
    pub success: bool,
}

impl TouchElement {
    pub fn new(element_id: impl Into<String>) -> Self {
        Self {
            element_id: element_id.into(),
            success: false,
        }
    }
}

impl Action for TouchElement {
    fn action_type(&self) -> ActionType {
        ActionType::ElementTouch
    }

    fn request(&self) -> Request {
        element_request(ActionType::ElementTouch, &self.element_id)
    }

    fn process_response(&mut self, response: &Response) -> Result<()> {
        self.success = response.success;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct LongTouchElement {
    pub element_id: String,
    pub success: bool,
}

impl LongTouchElement {
    pub fn new(element_id: impl Into<String>) -> Self {
        Self {
            element_id: element_id.into(),
            success: false,
        }
    }
}

impl Action for LongTouchElement {
    fn action_type(&self) -> ActionType {
        ActionType::LongTouch
    }

    fn request(&self) -> Request {
        element_request(ActionType::LongTouch, &self.element_id)
    }

    fn process_response(&mut self, response: &Response) -> Result<()> {
        self.success = response.success;
        Ok(())
    }
}

/// Drag one element onto another
#[derive(Debug, Clone, Default)]
pub struct DragAndDrop {
    pub from: String,
    pub to: String,
    pub success: bool,
}

impl DragAndDrop {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            success: false,
        }
    }
}

impl Action for DragAndDrop {
    fn action_type(&self) -> ActionType {
        ActionType::DragAndDrop
    }

    fn request(&self) -> Request {
        Request::with_payload(
            ActionType::DragAndDrop,
            RequestData {
                move_element: Some(MoveElement {
                    from: self.from.clone(),
                    to: self.to.clone(),
                }),
                ..Default::default()
            },
        )
    }

    fn process_response(&mut self, response: &Response) -> Result<()> {
        self.success = response.success;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_value_request_payload() {
        let request = SetValue::new("input", "text", "hello").request();
        let attr = request.payload.set_attr.unwrap();
        assert_eq!(request.action_type, ActionType::ElementSetValue);
        assert_eq!(attr.id, "input");
        assert_eq!(attr.val, "hello");
    }

    #[test]
    fn test_get_value_without_value_fails() {
        let mut action = GetValue::new("label", "text");
        let response = Response::new(ActionType::ElementGetValue, true);
        assert!(action.accept(&response).is_err());
    }

    #[test]
    fn test_drag_and_drop_request_payload() {
        let request = DragAndDrop::new("card", "slot").request();
        let move_element = request.payload.move_element.unwrap();
        assert_eq!(move_element.from, "card");
        assert_eq!(move_element.to, "slot");
    }
}
