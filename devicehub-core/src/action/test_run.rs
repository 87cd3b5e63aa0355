use devicehub_protocol::action::{RequestData, Test};
use devicehub_protocol::{ActionType, Request, Response};
use std::collections::HashMap;

use super::Action;
use crate::error::Result;

/// List the test methods compiled into the app
#[derive(Debug, Clone, Default)]
pub struct TestsGet {
    pub tests: Vec<Test>,
    pub success: bool,
}

impl Action for TestsGet {
    fn action_type(&self) -> ActionType {
        ActionType::GetTests
    }

    fn request(&self) -> Request {
        Request::new(ActionType::GetTests)
    }

    fn process_response(&mut self, response: &Response) -> Result<()> {
        self.tests = response
            .payload
            .tests
            .as_ref()
            .map(|t| t.tests.clone())
            .unwrap_or_default();
        self.success = response.success;
        Ok(())
    }
}

/// Start one test method; completion arrives later as `ExecutionResult`
#[derive(Debug, Clone, Default)]
pub struct TestStart {
    pub assembly: String,
    pub class: String,
    pub method: String,
    pub env: HashMap<String, String>,
    pub success: bool,
}

impl TestStart {
    pub fn new(
        assembly: impl Into<String>,
        class: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            assembly: assembly.into(),
            class: class.into(),
            method: method.into(),
            ..Default::default()
        }
    }
}

impl Action for TestStart {
    fn action_type(&self) -> ActionType {
        ActionType::ExecuteTest
    }

    fn request(&self) -> Request {
        Request::with_payload(
            ActionType::ExecuteTest,
            RequestData {
                test: Some(Test {
                    assembly: self.assembly.clone(),
                    class: self.class.clone(),
                    method: self.method.clone(),
                    parameter: self.env.clone(),
                    categories: Vec::new(),
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
pub struct UnityReset {
    pub success: bool,
}

impl Action for UnityReset {
    fn action_type(&self) -> ActionType {
        ActionType::UnityReset
    }

    fn request(&self) -> Request {
        Request::new(ActionType::UnityReset)
    }

    fn process_response(&mut self, response: &Response) -> Result<()> {
        self.success = response.success;
        Ok(())
    }
}
