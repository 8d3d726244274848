use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::{
    BackendError, ContextParams, InferenceBackend, ModelParams, SamplingParams, TokenId,
};

/// An in-memory engine for exercising the scheduler without a model.
///
/// Contexts record the tokens they hold and reject evaluations at the wrong
/// position, so a slot whose `cache_tokens` drifts from the context fails
/// loudly. Sampling is deterministic. Counters expose how much work the
/// scheduler actually asked for.
pub struct MockBackend {
    output: MockOutput,
    eos_after: Option<usize>,
    context_size: Option<usize>,
    max_contexts: Option<usize>,
    eval_delay: Option<Duration>,

    evaluated_tokens: AtomicUsize,
    evaluate_calls: AtomicUsize,
    binds: AtomicUsize,
    contexts_created: AtomicUsize,
    adapters_freed: Arc<AtomicUsize>,
    exclusion_violations: AtomicUsize,
    fail_next_evaluate: AtomicBool,
    failing_binds: AtomicUsize,

    active: Mutex<HashMap<usize, usize>>,
    broken_adapters: Mutex<HashSet<PathBuf>>,
    bound: Mutex<HashMap<usize, Vec<(String, f32)>>>,
}

#[derive(Debug, Clone, Copy)]
enum MockOutput {
    Fixed(TokenId),
    Counting(TokenId),
}

pub struct MockContext {
    id: usize,
    n_ctx: usize,
    tokens: Vec<TokenId>,
    last_sampled: Option<TokenId>,
    run: usize,
}

impl MockContext {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Tokens the context holds, in position order.
    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }
}

pub struct MockAdapter {
    path: String,
    freed: Arc<AtomicUsize>,
}

impl MockAdapter {
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for MockAdapter {
    fn drop(&mut self) {
        self.freed.fetch_add(1, Ordering::SeqCst);
    }
}

impl MockBackend {
    /// End-of-generation token. Tokenized text never produces it.
    pub const EOS: TokenId = 0;

    pub fn new() -> Self {
        Self {
            output: MockOutput::Fixed(TokenId::from(b'x')),
            eos_after: None,
            context_size: None,
            max_contexts: None,
            eval_delay: None,
            evaluated_tokens: AtomicUsize::new(0),
            evaluate_calls: AtomicUsize::new(0),
            binds: AtomicUsize::new(0),
            contexts_created: AtomicUsize::new(0),
            adapters_freed: Arc::new(AtomicUsize::new(0)),
            exclusion_violations: AtomicUsize::new(0),
            fail_next_evaluate: AtomicBool::new(false),
            failing_binds: AtomicUsize::new(0),
            active: Mutex::new(HashMap::new()),
            broken_adapters: Mutex::new(HashSet::new()),
            bound: Mutex::new(HashMap::new()),
        }
    }

    /// Always sample `token`.
    pub fn with_output_token(mut self, token: TokenId) -> Self {
        self.output = MockOutput::Fixed(token);
        self
    }

    /// Sample `start`, `start + 1`, ... within one generation run.
    pub fn with_counting_output(mut self, start: TokenId) -> Self {
        self.output = MockOutput::Counting(start);
        self
    }

    /// Sample EOS after `n` tokens of a generation run.
    pub fn with_eos_after(mut self, n: usize) -> Self {
        self.eos_after = Some(n);
        self
    }

    /// Override the context size requested by callers.
    pub fn with_context_size(mut self, n_ctx: usize) -> Self {
        self.context_size = Some(n_ctx);
        self
    }

    /// Fail context creation after `n` contexts.
    pub fn with_max_contexts(mut self, n: usize) -> Self {
        self.max_contexts = Some(n);
        self
    }

    /// Sleep this long in every evaluate call.
    pub fn with_eval_delay(mut self, delay: Duration) -> Self {
        self.eval_delay = Some(delay);
        self
    }

    pub fn fail_next_evaluate(&self) {
        self.fail_next_evaluate.store(true, Ordering::SeqCst);
    }

    /// Fail one more upcoming `bind_adapters` call.
    pub fn fail_next_bind(&self) {
        self.failing_binds.fetch_add(1, Ordering::SeqCst);
    }

    /// Make `load_adapter` fail for `path`.
    pub fn break_adapter(&self, path: impl AsRef<Path>) {
        self.broken_adapters
            .lock()
            .unwrap()
            .insert(path.as_ref().to_path_buf());
    }

    pub fn evaluated_tokens(&self) -> usize {
        self.evaluated_tokens.load(Ordering::SeqCst)
    }

    pub fn evaluate_calls(&self) -> usize {
        self.evaluate_calls.load(Ordering::SeqCst)
    }

    pub fn binds(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }

    pub fn contexts_created(&self) -> usize {
        self.contexts_created.load(Ordering::SeqCst)
    }

    pub fn adapters_freed(&self) -> usize {
        self.adapters_freed.load(Ordering::SeqCst)
    }

    /// Times two threads were inside the same context at once.
    pub fn exclusion_violations(&self) -> usize {
        self.exclusion_violations.load(Ordering::SeqCst)
    }

    /// `(path, scale)` pairs last bound to context `ctx_id`.
    pub fn bound_adapters(&self, ctx_id: usize) -> Vec<(String, f32)> {
        self.bound
            .lock()
            .unwrap()
            .get(&ctx_id)
            .cloned()
            .unwrap_or_default()
    }

    fn enter(&self, ctx_id: usize) {
        let mut active = self.active.lock().unwrap();
        let count = active.entry(ctx_id).or_insert(0);
        *count += 1;
        if *count > 1 {
            self.exclusion_violations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn leave(&self, ctx_id: usize) {
        if let Some(count) = self.active.lock().unwrap().get_mut(&ctx_id) {
            *count -= 1;
        }
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceBackend for MockBackend {
    type Context = MockContext;
    type Adapter = MockAdapter;

    fn load_model(_path: &Path, _params: &ModelParams) -> Result<Self, BackendError> {
        Ok(Self::new())
    }

    fn create_context(&self, params: &ContextParams) -> Result<MockContext, BackendError> {
        let id = self.contexts_created.fetch_add(1, Ordering::SeqCst);
        if self.max_contexts.is_some_and(|max| id >= max) {
            self.contexts_created.fetch_sub(1, Ordering::SeqCst);
            return Err(BackendError::ContextCreate("out of memory".to_string()));
        }
        Ok(MockContext {
            id,
            n_ctx: self.context_size.unwrap_or(params.n_ctx),
            tokens: Vec::new(),
            last_sampled: None,
            run: 0,
        })
    }

    fn context_size(&self, ctx: &MockContext) -> usize {
        ctx.n_ctx
    }

    fn evaluate(
        &self,
        ctx: &mut MockContext,
        tokens: &[TokenId],
        n_past: usize,
    ) -> Result<(), BackendError> {
        self.enter(ctx.id);
        let result = self.evaluate_inner(ctx, tokens, n_past);
        self.leave(ctx.id);
        result
    }

    fn truncate(&self, ctx: &mut MockContext, keep: usize) -> Result<(), BackendError> {
        ctx.tokens.truncate(keep);
        ctx.run = 0;
        ctx.last_sampled = None;
        Ok(())
    }

    fn sample(
        &self,
        ctx: &mut MockContext,
        _params: &SamplingParams,
    ) -> Result<TokenId, BackendError> {
        if ctx.tokens.is_empty() {
            return Err(BackendError::Sample("no logits: context is empty".to_string()));
        }
        let token = if self.eos_after.is_some_and(|n| ctx.run >= n) {
            Self::EOS
        } else {
            match self.output {
                MockOutput::Fixed(token) => token,
                MockOutput::Counting(start) => start + ctx.run as TokenId,
            }
        };
        if token == Self::EOS {
            ctx.run = 0;
            ctx.last_sampled = None;
        } else {
            ctx.run += 1;
            ctx.last_sampled = Some(token);
        }
        Ok(token)
    }

    fn eos_token(&self) -> TokenId {
        Self::EOS
    }

    fn load_adapter(&self, path: &Path) -> Result<MockAdapter, BackendError> {
        if self.broken_adapters.lock().unwrap().contains(path) {
            return Err(BackendError::AdapterLoad {
                path: path.to_path_buf(),
                reason: "not a LoRA adapter".to_string(),
            });
        }
        Ok(MockAdapter {
            path: path.display().to_string(),
            freed: Arc::clone(&self.adapters_freed),
        })
    }

    fn bind_adapters(
        &self,
        ctx: &mut MockContext,
        adapters: &[(&MockAdapter, f32)],
    ) -> Result<(), BackendError> {
        let failing = self
            .failing_binds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(BackendError::AdapterBind("injected failure".to_string()));
        }
        self.binds.fetch_add(1, Ordering::SeqCst);
        let set = adapters
            .iter()
            .map(|(adapter, scale)| (adapter.path.clone(), *scale))
            .collect();
        self.bound.lock().unwrap().insert(ctx.id, set);
        Ok(())
    }

    fn tokenize(&self, text: &str, _add_bos: bool) -> Result<Vec<TokenId>, BackendError> {
        Ok(text.bytes().map(TokenId::from).collect())
    }

    fn detokenize(&self, token: TokenId) -> Result<String, BackendError> {
        match u8::try_from(token) {
            Ok(byte) => Ok(char::from(byte).to_string()),
            Err(_) => Ok(format!("<{token}>")),
        }
    }
}

impl MockBackend {
    fn evaluate_inner(
        &self,
        ctx: &mut MockContext,
        tokens: &[TokenId],
        n_past: usize,
    ) -> Result<(), BackendError> {
        if let Some(delay) = self.eval_delay {
            std::thread::sleep(delay);
        }
        if self.fail_next_evaluate.swap(false, Ordering::SeqCst) {
            return Err(BackendError::Evaluate("injected failure".to_string()));
        }
        if n_past != ctx.tokens.len() {
            return Err(BackendError::Evaluate(format!(
                "position {n_past} but context holds {} tokens",
                ctx.tokens.len()
            )));
        }
        if n_past + tokens.len() > ctx.n_ctx {
            return Err(BackendError::Evaluate("context window exceeded".to_string()));
        }

        // A decode step continues the current run; anything else starts over.
        let continues_run =
            matches!((ctx.last_sampled, tokens), (Some(last), [token]) if *token == last);
        if !continues_run {
            ctx.run = 0;
        }
        ctx.last_sampled = None;
        ctx.tokens.extend_from_slice(tokens);
        self.evaluate_calls.fetch_add(1, Ordering::SeqCst);
        self.evaluated_tokens.fetch_add(tokens.len(), Ordering::SeqCst);
        Ok(())
    }
}
