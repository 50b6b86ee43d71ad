//! A scripted [Model] for tests.
//!
//! Every byte of text is one token (`byte + 3`); `1` is the beginning-of-text token and `2`
//! the end-of-text token. After the prompt, the model "predicts" the bytes of its script
//! one by one and then the end-of-text token.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use crate::{Batch, InferenceSessionConfig, Model, ModelContext, ModelError, TokenId};

pub(crate) const BOT: TokenId = 1;
pub(crate) const EOT: TokenId = 2;
const FIRST_BYTE: TokenId = 3;
const N_VOCAB: usize = 256 + FIRST_BYTE as usize;

#[derive(Debug)]
struct Failure;
impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "injected failure")
    }
}
impl std::error::Error for Failure {}

pub(crate) struct MockModel {
    script: Vec<u8>,
    cycle: bool,
    fail_context_creation: bool,
    fail_decode_at: Option<usize>,
    panic_marker: Option<String>,
    decode_delay: Option<Duration>,
    gate: Option<(flume::Sender<()>, flume::Receiver<()>)>,

    decode_calls: AtomicUsize,
    decoded_batches: Mutex<Vec<Batch>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}
impl MockModel {
    pub(crate) fn new(script: &str) -> Self {
        Self {
            script: script.as_bytes().to_vec(),
            cycle: false,
            fail_context_creation: false,
            fail_decode_at: None,
            panic_marker: None,
            decode_delay: None,
            gate: None,
            decode_calls: AtomicUsize::new(0),
            decoded_batches: Mutex::new(vec![]),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub(crate) fn token_for(byte: u8) -> TokenId {
        byte as TokenId + FIRST_BYTE
    }

    /// Repeat the script forever instead of ending the text.
    pub(crate) fn without_end(mut self) -> Self {
        self.cycle = true;
        self
    }

    pub(crate) fn fail_context_creation(mut self) -> Self {
        self.fail_context_creation = true;
        self
    }

    /// Fail the `call`th decode (zero-based, counted across all contexts).
    pub(crate) fn fail_decode_at(mut self, call: usize) -> Self {
        self.fail_decode_at = Some(call);
        self
    }

    /// Panic while tokenizing any text containing `marker`.
    pub(crate) fn panic_on(mut self, marker: &str) -> Self {
        self.panic_marker = Some(marker.to_owned());
        self
    }

    pub(crate) fn with_decode_delay(mut self, delay: Duration) -> Self {
        self.decode_delay = Some(delay);
        self
    }

    /// Every new context announces itself on `started` and then waits for a message on `open`.
    pub(crate) fn with_gate(
        mut self,
        started: flume::Sender<()>,
        open: flume::Receiver<()>,
    ) -> Self {
        self.gate = Some((started, open));
        self
    }

    pub(crate) fn decode_calls(&self) -> usize {
        self.decode_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn decoded_batches(&self) -> Vec<Batch> {
        self.decoded_batches.lock().unwrap().clone()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn predicted(&self, step: usize) -> TokenId {
        if self.cycle && !self.script.is_empty() {
            return Self::token_for(self.script[step % self.script.len()]);
        }
        self.script
            .get(step)
            .map(|&b| Self::token_for(b))
            .unwrap_or(EOT)
    }
}

impl Model for MockModel {
    type Context<'m> = MockContext<'m>;

    fn new_context(
        &self,
        config: &InferenceSessionConfig,
    ) -> Result<Self::Context<'_>, ModelError> {
        if self.fail_context_creation {
            return Err(ModelError::ContextCreation(Box::new(Failure)));
        }

        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        if let Some((started, open)) = &self.gate {
            started.send(()).unwrap();
            open.recv().unwrap();
        }

        Ok(MockContext {
            model: self,
            context_size: config.context_size,
            n_past: 0,
            prompt_len: None,
            logits: vec![],
        })
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, ModelError> {
        if let Some(marker) = &self.panic_marker {
            if text.contains(marker.as_str()) {
                panic!("tokenizer exploded");
            }
        }
        Ok(add_bos
            .then_some(BOT)
            .into_iter()
            .chain(text.bytes().map(Self::token_for))
            .collect())
    }

    fn token_to_bytes(&self, token: TokenId) -> Result<Vec<u8>, ModelError> {
        match token {
            BOT | EOT => Ok(vec![]),
            t if (FIRST_BYTE..N_VOCAB as TokenId).contains(&t) => Ok(vec![(t - FIRST_BYTE) as u8]),
            t => Err(ModelError::Detokenize {
                token: t,
                source: Box::new(Failure),
            }),
        }
    }

    fn eot_token_id(&self) -> TokenId {
        EOT
    }
}

pub(crate) struct MockContext<'m> {
    model: &'m MockModel,
    context_size: usize,
    n_past: usize,
    prompt_len: Option<usize>,
    logits: Vec<Option<Vec<f32>>>,
}
impl ModelContext for MockContext<'_> {
    fn context_size(&self) -> usize {
        self.context_size
    }

    fn decode(&mut self, batch: &Batch) -> Result<(), ModelError> {
        let model = self.model;
        let call = model.decode_calls.fetch_add(1, Ordering::SeqCst);
        model.decoded_batches.lock().unwrap().push(batch.clone());
        if let Some(delay) = model.decode_delay {
            std::thread::sleep(delay);
        }

        let failure = |batch: &Batch| ModelError::Decode {
            batch_size: batch.len(),
            source: Box::new(Failure),
        };
        if model.fail_decode_at == Some(call) || self.n_past + batch.len() > self.context_size {
            return Err(failure(batch));
        }
        for (i, (_, position, _)) in batch.iter().enumerate() {
            if position != self.n_past + i {
                return Err(failure(batch));
            }
        }

        let prompt_len = *self.prompt_len.get_or_insert(batch.len());
        self.logits = batch
            .iter()
            .map(|(_, position, wants_logits)| {
                wants_logits.then(|| {
                    let mut logits = vec![0.0; N_VOCAB];
                    let next = model.predicted(position + 1 - prompt_len);
                    logits[next as usize] = 10.0;
                    logits
                })
            })
            .collect();
        self.n_past += batch.len();
        Ok(())
    }

    fn logits(&self, index: usize) -> &[f32] {
        self.logits[index]
            .as_deref()
            .expect("logits were not requested for this entry")
    }
}
impl Drop for MockContext<'_> {
    fn drop(&mut self) {
        self.model.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
