use ctxprune_core::{
    host::{ConversationInfo, EntryPart, EntryRole, RequestOptions, TranscriptEntry},
    mock::{
        InMemoryDirectory, InMemoryHistory, InMemorySnapshots, InMemoryTranscripts,
        RecordingSender, SenderBehavior,
    },
    PruneContext, PruneService, SenderSlot, SettingsManager,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// One tool invocation used to build requests and transcripts.
#[derive(Clone)]
pub struct Call {
    pub id: &'static str,
    pub tool: &'static str,
    pub args: Value,
    pub output: &'static str,
}

#[allow(dead_code)]
pub fn call(id: &'static str, tool: &'static str, args: Value, output: &'static str) -> Call {
    Call {
        id,
        tool,
        args,
        output,
    }
}

pub struct Fixture {
    pub ctx: Arc<PruneContext>,
    pub service: PruneService,
    /// The process-level sender capability.
    pub slot: SenderSlot,
    pub sender: RecordingSender,
    pub directory: InMemoryDirectory,
    pub transcripts: InMemoryTranscripts,
    pub history: InMemoryHistory,
    pub snapshots: InMemorySnapshots,
    pub data_dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let data_dir = TempDir::new().unwrap();

        // Isolated settings so tests never touch the user's real settings
        let settings_path = data_dir.path().join(".ctxprune").join("settings.toml");
        let settings = SettingsManager::from_path(settings_path).unwrap();
        settings.update_setting(|s| s.debug.snapshots = true);

        let directory = InMemoryDirectory::new();
        directory.add(ConversationInfo::new("s1"));
        directory.add(ConversationInfo::new("s2"));
        directory.add(ConversationInfo::child_of("sub", "s1"));

        let transcripts = InMemoryTranscripts::new();
        let history = InMemoryHistory::new();
        let snapshots = InMemorySnapshots::new();

        let ctx = PruneContext::builder()
            .settings(settings)
            .directory(Arc::new(directory.clone()))
            .transcripts(Arc::new(transcripts.clone()))
            .history(Arc::new(history.clone()))
            .snapshots(Arc::new(snapshots.clone()))
            .build();
        let service = PruneService::new(ctx.clone());

        let sender = RecordingSender::new(SenderBehavior::Echo);
        let slot = SenderSlot::new(Arc::new(sender.clone()));

        Fixture {
            ctx,
            service,
            slot,
            sender,
            directory,
            transcripts,
            history,
            snapshots,
            data_dir,
        }
    }

    #[allow(dead_code)]
    pub fn data_path(&self) -> PathBuf {
        self.data_dir.path().to_path_buf()
    }

    /// A conversation-level capability derived from the process slot, with
    /// the conversation wrap attached when eligible.
    #[allow(dead_code)]
    pub async fn conversation_slot(&self, conversation_id: &str) -> SenderSlot {
        let slot = self.slot.derive();
        self.service.attach(&slot, conversation_id).await;
        slot
    }

    /// Sends `body` through `slot` and returns what reached the transport.
    #[allow(dead_code)]
    pub async fn send(&self, slot: &SenderSlot, body: &Value) -> Value {
        slot.send(
            "https://llm.example.com/v1/chat/completions",
            RequestOptions::post(body.to_string()),
        )
        .await
        .unwrap();
        self.sender.get_last_json().unwrap()
    }

    #[allow(dead_code)]
    pub fn set_transcript(&self, conversation_id: &str, calls: &[Call]) {
        self.transcripts
            .set(conversation_id, transcript(calls, true));
    }
}

/// `messages`-style request replaying `calls` as assistant tool calls
/// followed by their tool results.
#[allow(dead_code)]
pub fn chat_request(calls: &[Call]) -> Value {
    let mut messages = vec![json!({"role": "user", "content": "start"})];
    for call in calls {
        messages.push(json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{
                "id": call.id,
                "type": "function",
                "function": {"name": call.tool, "arguments": call.args.to_string()}
            }]
        }));
        messages.push(json!({
            "role": "tool",
            "tool_call_id": call.id,
            "content": call.output
        }));
    }
    json!({"model": "gpt-4o", "messages": messages})
}

/// `input`-style request with `function_call` / `function_call_output` pairs.
#[allow(dead_code)]
pub fn structured_request(calls: &[Call]) -> Value {
    let mut input = vec![json!({"role": "user", "content": "start"})];
    for call in calls {
        input.push(json!({
            "type": "function_call",
            "call_id": call.id,
            "name": call.tool,
            "arguments": call.args.to_string()
        }));
        input.push(json!({
            "type": "function_call_output",
            "call_id": call.id,
            "output": call.output
        }));
    }
    json!({"model": "gpt-5", "input": input})
}

/// Transcript holding one assistant entry per call. Without `with_input` the
/// entries omit arguments, as hosts that do not retain them do.
#[allow(dead_code)]
pub fn transcript(calls: &[Call], with_input: bool) -> Vec<TranscriptEntry> {
    calls
        .iter()
        .enumerate()
        .map(|(i, call)| TranscriptEntry {
            id: format!("m{i}"),
            role: EntryRole::Assistant,
            parts: vec![EntryPart::Tool {
                call_id: call.id.to_string(),
                tool: call.tool.to_string(),
                input: with_input.then(|| call.args.clone()),
                output: Some(call.output.to_string()),
            }],
        })
        .collect()
}

#[allow(dead_code)]
pub fn run<F, Fut>(test_fn: F)
where
    F: FnOnce(Fixture) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    use tokio::time::{timeout, Duration};

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to create tokio runtime");

    runtime.block_on(async {
        let fixture = Fixture::new();
        let test_future = test_fn(fixture);
        timeout(Duration::from_secs(30), test_future)
            .await
            .expect("Test timed out after 30 seconds");
    });
}
