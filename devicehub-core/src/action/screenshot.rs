use devicehub_protocol::action::{ContentType, Screenshot};
use devicehub_protocol::{ActionType, Request, Response};
use std::io::Cursor;
use tracing::warn;

use super::Action;
use crate::error::Result;

/// Width and height of an encoded PNG or JPEG, read from its header
pub fn image_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

#[derive(Debug, Clone, Default)]
pub struct GetScreenshot {
    pub success: bool,
    pub screenshot: Option<Screenshot>,
    pub width: u32,
    pub height: u32,
}

impl GetScreenshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encoded image bytes, empty when the agent sent none
    pub fn data(&self) -> &[u8] {
        self.screenshot
            .as_ref()
            .map(|s| s.screenshot.as_slice())
            .unwrap_or(&[])
    }

    /// Scene graph captured with the image, if it is in a text format
    pub fn scene_graph(&self) -> Option<String> {
        let shot = self.screenshot.as_ref()?;
        scene_graph_text(&shot.sceengraph, shot.content_type)
    }
}

impl Action for GetScreenshot {
    fn action_type(&self) -> ActionType {
        ActionType::GetScreenshot
    }

    fn request(&self) -> Request {
        Request::new(ActionType::GetScreenshot)
    }

    fn process_response(&mut self, response: &Response) -> Result<()> {
        self.success = response.success;
        self.screenshot = response.payload.screenshot.clone();

        if let Some(shot) = &self.screenshot {
            match image_dimensions(&shot.screenshot) {
                Some((width, height)) => {
                    self.width = width;
                    self.height = height;
                }
                None if !shot.screenshot.is_empty() => {
                    warn!("Screenshot with unknown image format ({} bytes)", shot.screenshot.len());
                }
                None => {}
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct GetSceneGraph {
    pub content: Vec<u8>,
    pub content_type: ContentType,
    pub success: bool,
}

impl GetSceneGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scene graph as text; flatbuffer payloads are not converted
    pub fn text(&self) -> Option<String> {
        scene_graph_text(&self.content, self.content_type)
    }
}

impl Action for GetSceneGraph {
    fn action_type(&self) -> ActionType {
        ActionType::GetSceneGraph
    }

    fn request(&self) -> Request {
        Request::new(ActionType::GetSceneGraph)
    }

    fn process_response(&mut self, response: &Response) -> Result<()> {
        self.success = response.success;
        if let Some(shot) = &response.payload.screenshot {
            self.content = shot.sceengraph.clone();
            self.content_type = shot.content_type;
        }
        Ok(())
    }
}

fn scene_graph_text(content: &[u8], content_type: ContentType) -> Option<String> {
    if content.is_empty() {
        return None;
    }
    match content_type {
        ContentType::Json | ContentType::Xml => Some(String::from_utf8_lossy(content).into_owned()),
        ContentType::Flatbuffer => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbaImage::new(width, height);
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_screenshot_reads_dimensions() {
        let mut response = Response::new(ActionType::GetScreenshot, true);
        response.payload.screenshot = Some(Screenshot {
            sceengraph: b"<Root/>".to_vec(),
            screenshot: png(64, 32),
            content_type: ContentType::Xml,
        });

        let mut action = GetScreenshot::new();
        action.accept(&response).unwrap();

        assert!(action.success);
        assert!(!action.data().is_empty());
        assert_eq!((action.width, action.height), (64, 32));
        assert_eq!(action.scene_graph().as_deref(), Some("<Root/>"));
    }

    #[test]
    fn test_screenshot_with_garbage_image_keeps_bytes() {
        let mut response = Response::new(ActionType::GetScreenshot, true);
        response.payload.screenshot = Some(Screenshot {
            screenshot: vec![1, 2, 3],
            ..Default::default()
        });

        let mut action = GetScreenshot::new();
        action.accept(&response).unwrap();
        assert_eq!(action.data(), &[1, 2, 3]);
        assert_eq!((action.width, action.height), (0, 0));
    }

    #[test]
    fn test_flatbuffer_scene_graph_not_converted() {
        let mut response = Response::new(ActionType::GetSceneGraph, true);
        response.payload.screenshot = Some(Screenshot {
            sceengraph: vec![0x10, 0x00],
            content_type: ContentType::Flatbuffer,
            ..Default::default()
        });

        let mut action = GetSceneGraph::new();
        action.accept(&response).unwrap();
        assert_eq!(action.content, vec![0x10, 0x00]);
        assert!(action.text().is_none());
    }
}
