//! Process runner double shared by adapter tests

use async_trait::async_trait;
use std::sync::Mutex;

use vpn_core::Result;
use vpn_core::process::{Invocation, ProcessOutput, ProcessRunner};

/// Answers invocations from a table keyed on any program or argument token
#[derive(Default)]
pub struct ScriptedRunner {
    responses: Mutex<Vec<(String, ProcessOutput)>>,
    invocations: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer invocations mentioning `token` with `output`
    pub fn respond(&self, token: &str, output: ProcessOutput) {
        self.responses
            .lock()
            .unwrap()
            .push((token.to_string(), output));
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(&self, invocation: &Invocation) -> Result<ProcessOutput> {
        self.invocations.lock().unwrap().push(invocation.clone());

        let responses = self.responses.lock().unwrap();
        let matched = responses.iter().find(|(token, _)| {
            invocation.program == *token || invocation.args.iter().any(|a| a == token)
        });

        Ok(matched
            .map(|(_, output)| output.clone())
            .unwrap_or_else(|| ProcessOutput::success("")))
    }
}
