// Serialization discipline: the single handler instance admits exactly one
// load/switch/generate at a time. The stub backend timestamps its active
// window so overlap would be observable.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use tokio::sync::Mutex;

use local_llm_service::config::ModelSettings;
use local_llm_service::models::{
    BackendLoader, GenerationRequest, ModelConfig, ModelHandler, TextGenBackend,
};

const EOS: u32 = 0;

type Spans = Arc<StdMutex<Vec<(Instant, Instant)>>>;

/// Records one (start, end) span per generation; each forward step widens
/// the span and holds the thread briefly so overlap would be measurable.
struct TimingBackend {
    script: Vec<u32>,
    step: usize,
    spans: Spans,
}

impl TextGenBackend for TimingBackend {
    fn encode(&self, text: &str) -> AnyResult<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn decode(&self, tokens: &[u32]) -> AnyResult<String> {
        Ok(tokens.iter().map(|&t| char::from(t as u8)).collect())
    }

    fn begin_session(&mut self) -> AnyResult<()> {
        self.step = 0;
        let now = Instant::now();
        self.spans.lock().unwrap().push((now, now));
        Ok(())
    }

    fn forward(&mut self, _tokens: &[u32], _index_pos: usize) -> AnyResult<Vec<f32>> {
        std::thread::sleep(Duration::from_millis(2));
        if let Some(span) = self.spans.lock().unwrap().last_mut() {
            span.1 = Instant::now();
        }
        let mut logits = vec![0.0; 256];
        let peak = self.script.get(self.step).copied().unwrap_or(EOS);
        logits[peak as usize] = 10.0;
        self.step += 1;
        Ok(logits)
    }

    fn is_eos(&self, token: u32) -> bool {
        token == EOS
    }
}

struct TimingLoader {
    spans: Spans,
    acquisitions: AtomicUsize,
}

#[async_trait]
impl BackendLoader for TimingLoader {
    async fn load(
        &self,
        _config: &ModelConfig,
        _settings: &ModelSettings,
    ) -> AnyResult<Box<dyn TextGenBackend>> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(TimingBackend {
            script: "serialized".bytes().map(u32::from).collect(),
            step: 0,
            spans: self.spans.clone(),
        }))
    }
}

fn settings() -> ModelSettings {
    ModelSettings {
        default_key: "tinyllama".to_string(),
        max_context: 2048,
        num_threads: 1,
        docs_path: "documentation.json".to_string(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_generations_serialize_through_one_critical_section() {
    let spans: Spans = Arc::new(StdMutex::new(Vec::new()));
    let loader = Arc::new(TimingLoader {
        spans: spans.clone(),
        acquisitions: AtomicUsize::new(0),
    });

    let mut handler = ModelHandler::new("tinyllama", settings(), loader.clone()).unwrap();
    handler.load().await.unwrap();
    let handler = Arc::new(Mutex::new(handler));

    let mut tasks = Vec::new();
    for i in 0..5 {
        let handler = handler.clone();
        tasks.push(tokio::spawn(async move {
            let request = GenerationRequest {
                prompt: format!("prompt number {i}"),
                max_tokens: 8,
                temperature: 0.0,
                model_key: None,
            };
            let mut guard = handler.lock().await;
            guard.generate(request).await
        }));
    }

    for task in tasks {
        let result = task.await.unwrap().unwrap();
        assert_eq!(result.model_used, "tinyllama");
        assert!(result.latency_seconds > 0.0);
    }

    // One backend acquisition serves all five requests.
    assert_eq!(loader.acquisitions.load(Ordering::SeqCst), 1);

    // Critical sections must not overlap: sorted by start, each span begins
    // after the previous one ended.
    let mut recorded = spans.lock().unwrap().clone();
    assert_eq!(recorded.len(), 5);
    recorded.sort_by_key(|(start, _)| *start);
    for pair in recorded.windows(2) {
        assert!(
            pair[1].0 >= pair[0].1,
            "generation windows overlapped; critical section was not exclusive"
        );
    }
}
