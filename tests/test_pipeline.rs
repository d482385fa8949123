//! End-to-end checks with the built-in n-gram engine: history → snapshot →
//! fine-tune → reload → reply.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use koe_bot::corpus::{self, CorpusEntry, HistoryStore, RawCorpus};
use koe_bot::engine::{Engine, NgramEngine};
use koe_bot::inference::{InferenceService, ReplyParams, UNAVAILABLE_MESSAGE};
use koe_bot::orchestrator::{CycleOutcome, Orchestrator, OrchestratorHandle, RetrainSettings, Trigger};
use koe_bot::registry::ModelRegistry;
use koe_bot::session::{SessionHandle, SessionIntent};
use koe_bot::subsystems::bot::BotCore;
use koe_bot::training::{self, StartFrom, TrainingOptions};

struct Pipeline {
    root: tempfile::TempDir,
    registry: Arc<ModelRegistry<NgramEngine>>,
    history: Arc<HistoryStore>,
    session: SessionHandle,
    handle: OrchestratorHandle,
    bot: Arc<BotCore<NgramEngine>>,
    shutdown: CancellationToken,
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn options() -> TrainingOptions {
    TrainingOptions { block_size: 16, start_from: StartFrom::Base, seed: Some(7) }
}

fn pipeline(period: Duration) -> Pipeline {
    let root = tempfile::tempdir().unwrap();
    let registry = Arc::new(
        ModelRegistry::open(root.path().join("models/base"), root.path().join("models/fine_tuned"), 3)
            .unwrap(),
    );
    training::ensure_base(&registry, NgramEngine::new(4, 1.0)).unwrap();

    let history = Arc::new(HistoryStore::open(root.path().join("history")).unwrap());
    let session = SessionHandle::new();
    let shutdown = CancellationToken::new();

    let settings = RetrainSettings {
        period,
        timeout: Some(Duration::from_secs(60)),
        ..RetrainSettings::with_snapshot_dir(root.path().join("data/weekly"))
    };
    let orchestrator = Arc::new(Orchestrator::new(
        registry.clone(),
        history.clone(),
        session.subscribe(),
        settings,
        options(),
        shutdown.clone(),
    ));
    let (handle, _) = OrchestratorHandle::spawn(orchestrator, shutdown.clone());

    let bot = Arc::new(BotCore::new(
        "koe".into(),
        "!koe".into(),
        session.clone(),
        history.clone(),
        registry.clone(),
        InferenceService::new(registry.clone(), ReplyParams::default()),
        handle.clone(),
        root.path().join("data"),
    ));

    Pipeline { root, registry, history, session, handle, bot, shutdown }
}

fn write_corpus(dir: &Path, line: &str, times: usize) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("chan.txt"), line.repeat(times)).unwrap();
}

#[test]
fn windowing_300_tokens_with_block_128_gives_two_examples() {
    let engine = NgramEngine::new(4, 1.0);
    let corpus = RawCorpus::new(vec![
        CorpusEntry { source_id: "b".into(), text: "y".repeat(100) },
        CorpusEntry { source_id: "a".into(), text: "x".repeat(200) },
    ]);
    let examples = corpus::build_examples(&corpus, &engine, 128).unwrap();
    assert_eq!(examples.len(), 2);
    for ex in &examples {
        assert_eq!(ex.input.len(), 127);
        assert_eq!(ex.label.len(), 127);
        assert_eq!(&ex.input[1..], &ex.label[..126]);
    }
    // Sources are concatenated in id order: "a" first.
    assert!(examples[0].input.iter().all(|&t| t == u32::from(b'x')));
}

#[tokio::test]
async fn reply_before_any_fine_tune_is_unavailable() {
    let p = pipeline(Duration::from_secs(3600));
    p.session.apply([SessionIntent::Start, SessionIntent::EnableSource("chan".into())]);
    assert_eq!(p.bot.handle("chan", "ping").await.as_deref(), Some(UNAVAILABLE_MESSAGE));
}

#[tokio::test]
async fn fine_tune_then_reload_changes_replies() {
    let p = pipeline(Duration::from_secs(3600));

    let first = p.root.path().join("corpus/first");
    write_corpus(&first, "ping pong\n", 40);
    let cycle = p.handle.fine_tune(vec![first]).await.unwrap();
    assert!(cycle.outcome.is_success(), "{:?}", cycle.outcome);
    let v1 = p.registry.current().unwrap().version.clone();

    p.bot.handle("chan", "!koe Run").await.unwrap();
    let reply = p.bot.handle("chan", "ping").await.unwrap();
    assert!(reply.starts_with("ping pon"), "unexpected reply {reply:?}");
    assert!(reply.len() <= 50, "reply longer than the bound: {reply:?}");

    let second = p.root.path().join("corpus/second");
    write_corpus(&second, "ping pang\n", 40);
    let cycle = p.handle.fine_tune(vec![second]).await.unwrap();
    assert!(cycle.outcome.is_success(), "{:?}", cycle.outcome);
    assert_ne!(p.registry.current().unwrap().version, v1);

    let reply = p.bot.handle("chan", "ping").await.unwrap();
    assert!(reply.starts_with("ping pan"), "unexpected reply {reply:?}");
}

#[tokio::test]
async fn failed_cycle_keeps_model_and_next_tick_still_fires() {
    let p = pipeline(Duration::from_millis(100));

    let seed = p.root.path().join("corpus/seed");
    write_corpus(&seed, "ping pong\n", 40);
    assert!(p.handle.fine_tune(vec![seed]).await.unwrap().outcome.is_success());
    let served = p.registry.current().unwrap();

    // Running, but nothing was said in the window.
    p.session.apply([SessionIntent::Start]);
    let failed = wait_for_cycle(&p, |o| matches!(o, CycleOutcome::Failed { .. })).await;
    assert_eq!(failed.trigger, Trigger::Timer);
    assert!(Arc::ptr_eq(&p.registry.current().unwrap(), &served));

    // Dialogue arrives; a later tick picks it up.
    for _ in 0..40 {
        p.history.append("chan", "ping pang", Utc::now()).unwrap();
    }
    let ok = wait_for_cycle(&p, CycleOutcome::is_success).await;
    assert_eq!(ok.trigger, Trigger::Timer);
    assert_ne!(p.registry.current().unwrap().version, served.version);
}

async fn wait_for_cycle(
    p: &Pipeline,
    want: impl Fn(&CycleOutcome) -> bool,
) -> koe_bot::orchestrator::RetrainCycle {
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = p.handle.status().await.unwrap();
        if let Some(cycle) = status.last_cycle.filter(|c| want(&c.outcome)) {
            return cycle;
        }
    }
    panic!("no matching cycle within 5s");
}

#[test]
fn corrupt_checkpoint_is_never_served() {
    let root = tempfile::tempdir().unwrap();
    let registry: ModelRegistry<NgramEngine> =
        ModelRegistry::open(root.path().join("base"), root.path().join("ft"), 3).unwrap();

    let staged = registry.stage().unwrap();
    let mut engine = NgramEngine::new(3, 1.0);
    let text = engine.encode("abcabc").unwrap();
    let batch = koe_bot::engine::Batch { inputs: vec![text[..5].to_vec()], labels: vec![text[1..].to_vec()] };
    engine.train_step(&batch).unwrap();
    engine.save(staged.path()).unwrap();
    let (version, path) = staged.commit().unwrap();
    std::fs::write(path.join("ngram.json"), b"{}").unwrap();

    let state = Arc::new(koe_bot::registry::EngineState { version, path, engine });
    registry.swap(state).unwrap();

    let reopened: ModelRegistry<NgramEngine> =
        ModelRegistry::open(root.path().join("base"), root.path().join("ft"), 3).unwrap();
    assert!(reopened.load().is_none());
}
