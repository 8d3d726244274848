//! llama.cpp bindings.
//!
//! The shared library is loaded at runtime, so the crate builds and tests
//! without it. Only the subset of the C API the slot scheduler needs is
//! bound: model and context lifetime, batched decode, KV truncation, logits,
//! tokenization and the `llama_lora_adapter_*` family.
//!
//! # Loading order
//!
//! 1. An explicit path passed to [`LlamaBackend::load`]
//! 2. `SLOTSERVE_LLAMA_SO_PATH` environment variable
//! 3. The platform's default name (`libllama.so`, `libllama.dylib`, `llama.dll`)

use std::ffi::{c_char, c_int, c_void, CString};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

use libloading::{Library, Symbol};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::backend::{
    BackendError, ContextParams, InferenceBackend, ModelParams, SamplingParams, TokenId,
};

const LLAMA_SO_PATH_ENV: &str = "SLOTSERVE_LLAMA_SO_PATH";

type LlamaToken = i32;
type LlamaPos = i32;
type LlamaSeqId = i32;

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct LlamaModelParams {
    n_gpu_layers: i32,
    split_mode: c_int,
    main_gpu: i32,
    tensor_split: *const f32,
    rpc_servers: *const c_char,
    progress_callback: *const c_void,
    progress_callback_user_data: *mut c_void,
    kv_overrides: *const c_void,
    vocab_only: bool,
    use_mmap: bool,
    use_mlock: bool,
    check_tensors: bool,
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct LlamaContextParams {
    seed: u32,
    n_ctx: u32,
    n_batch: u32,
    n_ubatch: u32,
    n_seq_max: u32,
    n_threads: u32,
    n_threads_batch: u32,
    rope_scaling_type: c_int,
    pooling_type: c_int,
    attention_type: c_int,
    rope_freq_base: f32,
    rope_freq_scale: f32,
    yarn_ext_factor: f32,
    yarn_attn_factor: f32,
    yarn_beta_fast: f32,
    yarn_beta_slow: f32,
    yarn_orig_ctx: u32,
    defrag_thold: f32,
    cb_eval: *const c_void,
    cb_eval_user_data: *mut c_void,
    type_k: c_int,
    type_v: c_int,
    logits_all: bool,
    embeddings: bool,
    offload_kqv: bool,
    flash_attn: bool,
    abort_callback: *const c_void,
    abort_callback_data: *mut c_void,
}

#[repr(C)]
#[allow(dead_code)]
struct LlamaBatch {
    n_tokens: i32,
    token: *mut LlamaToken,
    embd: *mut f32,
    pos: *mut LlamaPos,
    n_seq_id: *mut i32,
    seq_id: *mut *mut LlamaSeqId,
    logits: *mut i8,
    all_pos_0: LlamaPos,
    all_pos_1: LlamaPos,
    all_seq_id: LlamaSeqId,
}

type BackendInitFn = unsafe extern "C" fn();
type ModelDefaultParamsFn = unsafe extern "C" fn() -> LlamaModelParams;
type LoadModelFromFileFn = unsafe extern "C" fn(*const c_char, LlamaModelParams) -> *mut c_void;
type FreeModelFn = unsafe extern "C" fn(*mut c_void);
type ContextDefaultParamsFn = unsafe extern "C" fn() -> LlamaContextParams;
type NewContextWithModelFn = unsafe extern "C" fn(*mut c_void, LlamaContextParams) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);
type DecodeFn = unsafe extern "C" fn(*mut c_void, LlamaBatch) -> i32;
type KvCacheSeqRmFn = unsafe extern "C" fn(*mut c_void, LlamaSeqId, LlamaPos, LlamaPos) -> bool;
type GetLogitsIthFn = unsafe extern "C" fn(*mut c_void, i32) -> *mut f32;
type NVocabFn = unsafe extern "C" fn(*const c_void) -> i32;
type TokenEosFn = unsafe extern "C" fn(*const c_void) -> LlamaToken;
type NCtxFn = unsafe extern "C" fn(*const c_void) -> u32;
type TokenizeFn =
    unsafe extern "C" fn(*const c_void, *const c_char, i32, *mut LlamaToken, i32, bool, bool) -> i32;
type TokenToPieceFn =
    unsafe extern "C" fn(*const c_void, LlamaToken, *mut c_char, i32, i32, bool) -> i32;
type LoraAdapterInitFn = unsafe extern "C" fn(*mut c_void, *const c_char) -> *mut c_void;
type LoraAdapterSetFn = unsafe extern "C" fn(*mut c_void, *mut c_void, f32) -> i32;
type LoraAdapterClearFn = unsafe extern "C" fn(*mut c_void);
type LoraAdapterFreeFn = unsafe extern "C" fn(*mut c_void);

/// Function table resolved from the shared library.
struct LlamaApi {
    _library: Library,
    backend_init: BackendInitFn,
    model_default_params: ModelDefaultParamsFn,
    load_model_from_file: LoadModelFromFileFn,
    free_model: FreeModelFn,
    context_default_params: ContextDefaultParamsFn,
    new_context_with_model: NewContextWithModelFn,
    free: FreeFn,
    decode: DecodeFn,
    kv_cache_seq_rm: KvCacheSeqRmFn,
    get_logits_ith: GetLogitsIthFn,
    n_vocab: NVocabFn,
    token_eos: TokenEosFn,
    n_ctx: NCtxFn,
    tokenize: TokenizeFn,
    token_to_piece: TokenToPieceFn,
    lora_adapter_init: LoraAdapterInitFn,
    lora_adapter_set: LoraAdapterSetFn,
    lora_adapter_clear: LoraAdapterClearFn,
    lora_adapter_free: LoraAdapterFreeFn,
}

unsafe fn symbol<T: Copy>(library: &Library, name: &str) -> Result<T, BackendError> {
    let symbol: Symbol<T> = library
        .get(name.as_bytes())
        .map_err(|e| BackendError::Library(format!("{name}: {e}")))?;
    Ok(*symbol)
}

impl LlamaApi {
    fn load(explicit: Option<&Path>) -> Result<Self, BackendError> {
        if let Some(path) = explicit {
            return Self::from_path(path);
        }
        if let Ok(path) = std::env::var(LLAMA_SO_PATH_ENV) {
            match Self::from_path(Path::new(&path)) {
                Ok(api) => {
                    tracing::debug!(path = %path, "loaded llama library from SLOTSERVE_LLAMA_SO_PATH");
                    return Ok(api);
                }
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "SLOTSERVE_LLAMA_SO_PATH set but failed to load, trying default name");
                }
            }
        }
        Self::from_path(Path::new(&libloading::library_filename("llama")))
    }

    fn from_path(path: &Path) -> Result<Self, BackendError> {
        let library = unsafe { Library::new(path) }
            .map_err(|e| BackendError::Library(format!("{}: {e}", path.display())))?;
        unsafe {
            Ok(Self {
                backend_init: symbol(&library, "llama_backend_init")?,
                model_default_params: symbol(&library, "llama_model_default_params")?,
                load_model_from_file: symbol(&library, "llama_load_model_from_file")?,
                free_model: symbol(&library, "llama_free_model")?,
                context_default_params: symbol(&library, "llama_context_default_params")?,
                new_context_with_model: symbol(&library, "llama_new_context_with_model")?,
                free: symbol(&library, "llama_free")?,
                decode: symbol(&library, "llama_decode")?,
                kv_cache_seq_rm: symbol(&library, "llama_kv_cache_seq_rm")?,
                get_logits_ith: symbol(&library, "llama_get_logits_ith")?,
                n_vocab: symbol(&library, "llama_n_vocab")?,
                token_eos: symbol(&library, "llama_token_eos")?,
                n_ctx: symbol(&library, "llama_n_ctx")?,
                tokenize: symbol(&library, "llama_tokenize")?,
                token_to_piece: symbol(&library, "llama_token_to_piece")?,
                lora_adapter_init: symbol(&library, "llama_lora_adapter_init")?,
                lora_adapter_set: symbol(&library, "llama_lora_adapter_set")?,
                lora_adapter_clear: symbol(&library, "llama_lora_adapter_clear")?,
                lora_adapter_free: symbol(&library, "llama_lora_adapter_free")?,
                _library: library,
            })
        }
    }
}

/// Owns the native model; freed after every context and adapter using it.
struct ModelHandle {
    api: LlamaApi,
    raw: *mut c_void,
    n_vocab: usize,
    eos: LlamaToken,
}

// The model is immutable after load and llama.cpp allows concurrent use from
// multiple contexts.
unsafe impl Send for ModelHandle {}
unsafe impl Sync for ModelHandle {}

impl Drop for ModelHandle {
    fn drop(&mut self) {
        unsafe { (self.api.free_model)(self.raw) };
    }
}

/// llama.cpp engine shared by every slot.
#[derive(Clone)]
pub struct LlamaBackend {
    model: Arc<ModelHandle>,
}

/// One llama.cpp context.
pub struct LlamaContext {
    model: Arc<ModelHandle>,
    raw: *mut c_void,
    n_ctx: usize,
    /// Batch index of the most recent logits.
    logits_index: Option<i32>,
    rng: StdRng,
}

// A context is only ever used by the thread that holds its slot.
unsafe impl Send for LlamaContext {}

impl Drop for LlamaContext {
    fn drop(&mut self) {
        unsafe { (self.model.api.free)(self.raw) };
    }
}

/// A loaded LoRA adapter.
pub struct LlamaAdapter {
    model: Arc<ModelHandle>,
    raw: *mut c_void,
    path: PathBuf,
}

unsafe impl Send for LlamaAdapter {}
unsafe impl Sync for LlamaAdapter {}

impl LlamaAdapter {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LlamaAdapter {
    fn drop(&mut self) {
        tracing::debug!(path = %self.path.display(), "freeing adapter");
        unsafe { (self.model.api.lora_adapter_free)(self.raw) };
    }
}

static BACKEND_INIT: Once = Once::new();

impl LlamaBackend {
    /// Load the library (see module docs for the search order) and a model.
    pub fn load(
        library: Option<&Path>,
        model: &Path,
        params: &ModelParams,
    ) -> Result<Self, BackendError> {
        let api = LlamaApi::load(library)?;
        BACKEND_INIT.call_once(|| unsafe { (api.backend_init)() });

        let c_path = path_to_cstring(model)?;
        let mut native = unsafe { (api.model_default_params)() };
        native.n_gpu_layers = params.gpu_layers;
        native.main_gpu = params.main_gpu;
        native.use_mmap = params.use_mmap;
        native.use_mlock = params.use_mlock;

        let raw = unsafe { (api.load_model_from_file)(c_path.as_ptr(), native) };
        if raw.is_null() {
            return Err(BackendError::ModelLoad {
                path: model.to_path_buf(),
                reason: "llama_load_model_from_file returned null".to_string(),
            });
        }
        let n_vocab = unsafe { (api.n_vocab)(raw) };
        let eos = unsafe { (api.token_eos)(raw) };
        let handle = ModelHandle {
            api,
            raw,
            n_vocab: usize::try_from(n_vocab).unwrap_or(0),
            eos,
        };
        tracing::info!(
            path = %model.display(),
            n_vocab = handle.n_vocab,
            gpu_layers = params.gpu_layers,
            mmap = params.use_mmap,
            "model loaded"
        );
        Ok(Self {
            model: Arc::new(handle),
        })
    }

    fn api(&self) -> &LlamaApi {
        &self.model.api
    }
}

impl InferenceBackend for LlamaBackend {
    type Context = LlamaContext;
    type Adapter = LlamaAdapter;

    fn load_model(path: &Path, params: &ModelParams) -> Result<Self, BackendError> {
        Self::load(None, path, params)
    }

    fn create_context(&self, params: &ContextParams) -> Result<LlamaContext, BackendError> {
        let mut native = unsafe { (self.api().context_default_params)() };
        native.n_ctx = to_u32(params.n_ctx, "n_ctx")?;
        native.n_batch = to_u32(params.n_batch, "n_batch")?;
        native.n_ubatch = native.n_batch;
        native.n_seq_max = 1;
        if let Some(threads) = params.n_threads {
            native.n_threads = to_u32(threads, "n_threads")?;
            native.n_threads_batch = native.n_threads;
        }

        let raw = unsafe { (self.api().new_context_with_model)(self.model.raw, native) };
        if raw.is_null() {
            return Err(BackendError::ContextCreate(
                "llama_new_context_with_model returned null".to_string(),
            ));
        }
        let n_ctx = unsafe { (self.api().n_ctx)(raw) } as usize;
        Ok(LlamaContext {
            model: Arc::clone(&self.model),
            raw,
            n_ctx,
            logits_index: None,
            rng: StdRng::from_entropy(),
        })
    }

    fn context_size(&self, ctx: &LlamaContext) -> usize {
        ctx.n_ctx
    }

    fn evaluate(
        &self,
        ctx: &mut LlamaContext,
        tokens: &[TokenId],
        n_past: usize,
    ) -> Result<(), BackendError> {
        if tokens.is_empty() {
            return Ok(());
        }
        let mut token_ids = tokens
            .iter()
            .map(|&t| LlamaToken::try_from(t))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| BackendError::Evaluate(format!("token id out of range: {e}")))?;
        let start = to_i32(n_past, "position")?;
        let n_tokens = to_i32(tokens.len(), "batch size")?;
        let mut pos: Vec<LlamaPos> = (start..start + n_tokens).collect();
        let mut n_seq_id = vec![1i32; tokens.len()];
        let mut seq_storage: Vec<LlamaSeqId> = vec![0; tokens.len()];
        let mut seq_id: Vec<*mut LlamaSeqId> = seq_storage
            .iter_mut()
            .map(|s| s as *mut LlamaSeqId)
            .collect();
        let mut logits = vec![0i8; tokens.len()];
        if let Some(last) = logits.last_mut() {
            *last = 1;
        }

        let batch = LlamaBatch {
            n_tokens,
            token: token_ids.as_mut_ptr(),
            embd: std::ptr::null_mut(),
            pos: pos.as_mut_ptr(),
            n_seq_id: n_seq_id.as_mut_ptr(),
            seq_id: seq_id.as_mut_ptr(),
            logits: logits.as_mut_ptr(),
            all_pos_0: 0,
            all_pos_1: 0,
            all_seq_id: 0,
        };
        let status = unsafe { (self.api().decode)(ctx.raw, batch) };
        match status {
            0 => {
                ctx.logits_index = Some(n_tokens - 1);
                Ok(())
            }
            1 => Err(BackendError::Evaluate(
                "no KV cache slot available for batch".to_string(),
            )),
            code => Err(BackendError::Evaluate(format!("llama_decode returned {code}"))),
        }
    }

    fn truncate(&self, ctx: &mut LlamaContext, keep: usize) -> Result<(), BackendError> {
        let keep = to_i32(keep, "position")?;
        let removed = unsafe { (self.api().kv_cache_seq_rm)(ctx.raw, 0, keep, -1) };
        ctx.logits_index = None;
        if removed {
            Ok(())
        } else {
            Err(BackendError::Evaluate(format!(
                "failed to remove KV cache entries from position {keep}"
            )))
        }
    }

    fn sample(
        &self,
        ctx: &mut LlamaContext,
        params: &SamplingParams,
    ) -> Result<TokenId, BackendError> {
        let index = ctx
            .logits_index
            .ok_or_else(|| BackendError::Sample("no logits available".to_string()))?;
        let ptr = unsafe { (self.api().get_logits_ith)(ctx.raw, index) };
        if ptr.is_null() {
            return Err(BackendError::Sample(format!("no logits for batch index {index}")));
        }
        let logits = unsafe { std::slice::from_raw_parts(ptr, self.model.n_vocab) };
        let token = sample_logits(logits, params, &mut ctx.rng)?;
        TokenId::try_from(token).map_err(|e| BackendError::Sample(e.to_string()))
    }

    fn eos_token(&self) -> TokenId {
        TokenId::try_from(self.model.eos).unwrap_or(TokenId::MAX)
    }

    fn load_adapter(&self, path: &Path) -> Result<LlamaAdapter, BackendError> {
        let c_path = path_to_cstring(path)?;
        let raw = unsafe { (self.api().lora_adapter_init)(self.model.raw, c_path.as_ptr()) };
        if raw.is_null() {
            return Err(BackendError::AdapterLoad {
                path: path.to_path_buf(),
                reason: "llama_lora_adapter_init returned null".to_string(),
            });
        }
        Ok(LlamaAdapter {
            model: Arc::clone(&self.model),
            raw,
            path: path.to_path_buf(),
        })
    }

    fn bind_adapters(
        &self,
        ctx: &mut LlamaContext,
        adapters: &[(&LlamaAdapter, f32)],
    ) -> Result<(), BackendError> {
        unsafe { (self.api().lora_adapter_clear)(ctx.raw) };
        for (adapter, scale) in adapters {
            let status = unsafe { (self.api().lora_adapter_set)(ctx.raw, adapter.raw, *scale) };
            if status != 0 {
                return Err(BackendError::AdapterBind(format!(
                    "llama_lora_adapter_set({}) returned {status}",
                    adapter.path.display()
                )));
            }
        }
        Ok(())
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, BackendError> {
        let len = to_i32(text.len(), "text length")?;
        let mut tokens: Vec<LlamaToken> = vec![0; text.len() + 2];
        let mut n = unsafe {
            (self.api().tokenize)(
                self.model.raw,
                text.as_ptr().cast(),
                len,
                tokens.as_mut_ptr(),
                to_i32(tokens.len(), "token buffer")?,
                add_bos,
                false,
            )
        };
        if n < 0 {
            tokens.resize(n.unsigned_abs() as usize, 0);
            n = unsafe {
                (self.api().tokenize)(
                    self.model.raw,
                    text.as_ptr().cast(),
                    len,
                    tokens.as_mut_ptr(),
                    to_i32(tokens.len(), "token buffer")?,
                    add_bos,
                    false,
                )
            };
        }
        let n = usize::try_from(n)
            .map_err(|_| BackendError::Tokenize(format!("llama_tokenize returned {n}")))?;
        tokens.truncate(n);
        tokens
            .into_iter()
            .map(|t| TokenId::try_from(t).map_err(|e| BackendError::Tokenize(e.to_string())))
            .collect()
    }

    fn detokenize(&self, token: TokenId) -> Result<String, BackendError> {
        let token = LlamaToken::try_from(token).map_err(|e| BackendError::Tokenize(e.to_string()))?;
        let mut buf = vec![0u8; 64];
        loop {
            let n = unsafe {
                (self.api().token_to_piece)(
                    self.model.raw,
                    token,
                    buf.as_mut_ptr().cast(),
                    to_i32(buf.len(), "piece buffer")?,
                    0,
                    false,
                )
            };
            if n >= 0 {
                buf.truncate(n as usize);
                return Ok(String::from_utf8_lossy(&buf).into_owned());
            }
            let needed = n.unsigned_abs() as usize;
            if needed <= buf.len() {
                return Err(BackendError::Tokenize(format!(
                    "llama_token_to_piece returned {n}"
                )));
            }
            buf.resize(needed, 0);
        }
    }
}

/// Pick a token id from raw logits.
///
/// Temperature `<= 0` is greedy. Otherwise the `top_k` best candidates (all
/// of them when `top_k` is 0) are sampled from their tempered softmax.
pub(crate) fn sample_logits<R: rand::Rng>(
    logits: &[f32],
    params: &SamplingParams,
    rng: &mut R,
) -> Result<usize, BackendError> {
    if logits.is_empty() {
        return Err(BackendError::Sample("empty logits".to_string()));
    }
    if params.temperature <= 0.0 {
        return Ok(argmax(logits));
    }

    let mut candidates: Vec<(usize, f32)> = logits.iter().copied().enumerate().collect();
    if params.top_k > 0 && params.top_k < candidates.len() {
        candidates.select_nth_unstable_by(params.top_k - 1, |a, b| b.1.total_cmp(&a.1));
        candidates.truncate(params.top_k);
    }
    let max = candidates
        .iter()
        .map(|&(_, logit)| logit)
        .fold(f32::NEG_INFINITY, f32::max);
    let weights: Vec<f64> = candidates
        .iter()
        .map(|&(_, logit)| f64::from((logit - max) / params.temperature).exp())
        .collect();
    let dist = WeightedIndex::new(&weights).map_err(|e| BackendError::Sample(e.to_string()))?;
    Ok(candidates[dist.sample(rng)].0)
}

fn argmax(logits: &[f32]) -> usize {
    logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(index, _)| index)
        .unwrap_or(0)
}

fn path_to_cstring(path: &Path) -> Result<CString, BackendError> {
    let text = path
        .to_str()
        .ok_or_else(|| BackendError::Library(format!("path is not UTF-8: {}", path.display())))?;
    CString::new(text)
        .map_err(|_| BackendError::Library(format!("path contains NUL: {}", path.display())))
}

fn to_i32(value: usize, what: &str) -> Result<i32, BackendError> {
    i32::try_from(value).map_err(|_| BackendError::Evaluate(format!("{what} {value} out of range")))
}

fn to_u32(value: usize, what: &str) -> Result<u32, BackendError> {
    u32::try_from(value)
        .map_err(|_| BackendError::ContextCreate(format!("{what} {value} out of range")))
}
