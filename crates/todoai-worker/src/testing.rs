//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use todoai_ai::{AiError, AiResult, DueDateTagger, TaskAnalysis, TaskTagger};
use todoai_models::TagStatistics;

/// One scripted tagger response.
pub(crate) enum Scripted {
    Ok(TaskAnalysis),
    Err(fn() -> AiError),
}

/// Tagger replaying a script of responses; an empty script answers with an
/// empty analysis.
pub(crate) struct ScriptedTagger {
    script: Mutex<VecDeque<Scripted>>,
    rich: bool,
    minimal_calls: AtomicUsize,
    rich_calls: AtomicUsize,
    last_context: Mutex<Option<String>>,
}

impl ScriptedTagger {
    fn build(rich: bool, script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            rich,
            minimal_calls: AtomicUsize::new(0),
            rich_calls: AtomicUsize::new(0),
            last_context: Mutex::new(None),
        }
    }

    /// Exposes the due-date capability.
    pub fn rich(script: Vec<Scripted>) -> Self {
        Self::build(true, script)
    }

    pub fn minimal(script: Vec<Scripted>) -> Self {
        Self::build(false, script)
    }

    pub fn minimal_calls(&self) -> usize {
        self.minimal_calls.load(Ordering::SeqCst)
    }

    pub fn rich_calls(&self) -> usize {
        self.rich_calls.load(Ordering::SeqCst)
    }

    pub fn last_context(&self) -> Option<String> {
        self.last_context.lock().unwrap().clone()
    }

    fn next(&self, context: Option<&str>) -> AiResult<TaskAnalysis> {
        *self.last_context.lock().unwrap() = context.map(str::to_string);
        match self.script.lock().unwrap().pop_front() {
            Some(Scripted::Ok(analysis)) => Ok(analysis),
            Some(Scripted::Err(make)) => Err(make()),
            None => Ok(TaskAnalysis::default()),
        }
    }
}

#[async_trait]
impl TaskTagger for ScriptedTagger {
    async fn analyze_task(&self, _text: &str, context: Option<&str>) -> AiResult<TaskAnalysis> {
        self.minimal_calls.fetch_add(1, Ordering::SeqCst);
        self.next(context)
    }

    fn due_date_capability(&self) -> Option<&dyn DueDateTagger> {
        if self.rich {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl DueDateTagger for ScriptedTagger {
    async fn analyze_task_with_due_date(
        &self,
        _text: &str,
        _due_date: Option<DateTime<Utc>>,
        _created_at: DateTime<Utc>,
        context: Option<&str>,
        _tag_stats: Option<&TagStatistics>,
    ) -> AiResult<TaskAnalysis> {
        self.rich_calls.fetch_add(1, Ordering::SeqCst);
        self.next(context)
    }
}
