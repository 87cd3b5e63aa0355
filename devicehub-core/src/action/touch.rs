use devicehub_protocol::action::{MoveOffset, RequestData, Touch};
use devicehub_protocol::{ActionType, Request, Response};

use super::Action;
use crate::error::Result;

/// Raw touch at screen coordinates (down, move or up phase)
#[derive(Debug, Clone)]
pub struct TouchPosition {
    phase: ActionType,
    pub x: i64,
    pub y: i64,
    pub success: bool,
}

impl TouchPosition {
    pub fn down(x: i64, y: i64) -> Self {
        Self::with_phase(ActionType::TouchDown, x, y)
    }

    pub fn moved(x: i64, y: i64) -> Self {
        Self::with_phase(ActionType::TouchMove, x, y)
    }

    pub fn up(x: i64, y: i64) -> Self {
        Self::with_phase(ActionType::TouchUp, x, y)
    }

    fn with_phase(phase: ActionType, x: i64, y: i64) -> Self {
        Self {
            phase,
            x,
            y,
            success: false,
        }
    }
}

impl Action for TouchPosition {
    fn action_type(&self) -> ActionType {
        self.phase
    }

    fn request(&self) -> Request {
        Request::with_payload(
            self.phase,
            RequestData {
                touch: Some(Touch {
                    id: String::new(),
                    xoffset: self.x,
                    yoffset: self.y,
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

/// Scroll the current view by an offset
#[derive(Debug, Clone, Default)]
pub struct Scroll {
    pub offset_x: i64,
    pub offset_y: i64,
    pub success: bool,
}

impl Scroll {
    pub fn new(offset_x: i64, offset_y: i64) -> Self {
        Self {
            offset_x,
            offset_y,
            success: false,
        }
    }
}

impl Action for Scroll {
    fn action_type(&self) -> ActionType {
        ActionType::Move
    }

    fn request(&self) -> Request {
        Request::with_payload(
            ActionType::Move,
            RequestData {
                move_offset: Some(MoveOffset {
                    from: self.offset_x,
                    to: self.offset_y,
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
