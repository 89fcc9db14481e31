#![deny(unsafe_code)]

//! # Overview
//!
//! The streaming cipher pipeline that sits between the transport threads
//! and the wire. A [`Pipeline`] owns a fixed pool of worker threads, each
//! holding its own initialized cipher context, and applies the configured
//! [`core::CipherSuite`] to a buffer in fixed-size sub-blocks, one sub-block
//! per worker, in parallel.
//!
//! # Design
//!
//! Grounded in the original encryption thread pool (`crypto.h`/`crypto.cpp`):
//! a small number of worker threads (`MAX_CRYPTO_THREADS`), each assigned a
//! slot, each slot handed a sub-block of the current transfer block to
//! transform in place. The original hands work to a worker by spinning on
//! `try_lock` until a per-slot mutex is free; here each [`Slot`] instead
//! pairs a `Mutex<SlotState>` with a `Condvar`, so a worker blocks instead of
//! polling and `submit`/`drain` are the only two operations callers need.
//!
//! `submit` copies a sub-block into the slot and wakes the worker; it does
//! not wait for the result. `drain` is the barrier: it blocks until every
//! slot submitted to since the last drain has finished, surfacing the first
//! cipher failure encountered. A cipher failure poisons the pipeline —
//! matching the original's "abort the whole transfer on a crypto error"
//! behavior — so every subsequent `submit`/`drain` call fails fast instead
//! of silently passing plaintext through.
//!
//! CFB mode is implemented directly against the `cipher` crate's
//! `BlockEncrypt`/`BlockSizeUser` traits rather than a dedicated mode crate:
//! CFB only ever needs the block cipher's *encrypt* direction (true for both
//! encryption and decryption of the stream), so a small generic helper
//! covers AES, 3DES, and Blowfish uniformly. CTR mode, used only with AES,
//! goes through the `ctr` crate's `StreamCipher` interface, which is
//! symmetric in both directions.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use cipher::{BlockEncrypt, BlockSizeUser, KeyInit};
use cipher::generic_array::GenericArray;
use ctr::cipher::{KeyIvInit, StreamCipher};

use core::CipherSuite;

/// Errors from initializing or running the cipher pipeline.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// The key handed to [`Pipeline::new`] didn't match the suite's
    /// required length.
    #[error("cipher suite {suite:?} requires a {expected}-byte key, got {actual}")]
    KeyLength {
        suite: CipherSuite,
        expected: usize,
        actual: usize,
    },
    /// A worker's cipher context failed mid-transfer. Once this happens the
    /// pipeline is poisoned and refuses further work.
    #[error("crypto worker {slot} failed: {reason}")]
    WorkerFailed { slot: usize, reason: String },
    /// `submit`/`drain` called on a pipeline that already recorded a
    /// worker failure.
    #[error("crypto pipeline is poisoned by a prior failure")]
    Poisoned,
}

/// Which direction a CFB context is running. CTR contexts don't need this:
/// the keystream XOR is its own inverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Encrypt,
    Decrypt,
}

/// A hand-rolled CFB-mode shift register over any block cipher that can
/// encrypt a single block in place.
struct Cfb<C: BlockEncrypt + BlockSizeUser> {
    cipher: C,
    feedback: GenericArray<u8, C::BlockSize>,
    direction: Direction,
}

impl<C: BlockEncrypt + BlockSizeUser> Cfb<C> {
    fn new(cipher: C, iv: &[u8], direction: Direction) -> Self {
        let mut feedback = GenericArray::<u8, C::BlockSize>::default();
        let n = feedback.len().min(iv.len());
        feedback[..n].copy_from_slice(&iv[..n]);
        Self {
            cipher,
            feedback,
            direction,
        }
    }

    /// Applies CFB in place, one cipher block at a time. The final partial
    /// block (if any) is XORed with a truncated keystream block, which is
    /// safe because the feedback register for a short final block is never
    /// consumed afterward.
    fn apply_inplace(&mut self, buf: &mut [u8]) {
        for chunk in buf.chunks_mut(self.feedback.len()) {
            let mut keystream = self.feedback.clone();
            self.cipher.encrypt_block(&mut keystream);

            // The next feedback register is always the ciphertext bytes.
            // Stash them before the decrypt XOR overwrites `chunk`.
            let ciphertext_before_decrypt = match self.direction {
                Direction::Decrypt => Some(chunk.to_vec()),
                Direction::Encrypt => None,
            };

            for (byte, key) in chunk.iter_mut().zip(keystream.iter()) {
                *byte ^= *key;
            }

            let next_feedback = match ciphertext_before_decrypt {
                Some(ciphertext) => ciphertext,
                None => chunk.to_vec(),
            };
            let n = self.feedback.len().min(next_feedback.len());
            self.feedback[..n].copy_from_slice(&next_feedback[..n]);
        }
    }
}

/// A per-suite cipher context, already keyed and ready to transform
/// sub-blocks. CTR variants are symmetric in both directions; CFB variants
/// carry the [`Direction`] they were constructed with.
enum Engine {
    Cfb128(Cfb<aes::Aes128>),
    Cfb192(Cfb<aes::Aes192>),
    Cfb256(Cfb<aes::Aes256>),
    Ctr128(ctr::Ctr128BE<aes::Aes128>),
    Ctr192(ctr::Ctr128BE<aes::Aes192>),
    Ctr256(ctr::Ctr128BE<aes::Aes256>),
    Cfb3Des(Cfb<des::TdesEde3>),
    CfbBlowfish(Cfb<blowfish::Blowfish>),
}

impl Engine {
    fn new(
        suite: CipherSuite,
        key: &[u8],
        iv: &[u8],
        direction: Direction,
    ) -> Result<Self, CryptoError> {
        let expected = suite.key_len();
        if key.len() != expected {
            return Err(CryptoError::KeyLength {
                suite,
                expected,
                actual: key.len(),
            });
        }
        Ok(match suite {
            CipherSuite::Aes128Cfb => {
                let cipher = aes::Aes128::new(GenericArray::from_slice(key));
                Engine::Cfb128(Cfb::new(cipher, iv, direction))
            }
            CipherSuite::Aes192Cfb => {
                let cipher = aes::Aes192::new(GenericArray::from_slice(key));
                Engine::Cfb192(Cfb::new(cipher, iv, direction))
            }
            CipherSuite::Aes256Cfb => {
                let cipher = aes::Aes256::new(GenericArray::from_slice(key));
                Engine::Cfb256(Cfb::new(cipher, iv, direction))
            }
            CipherSuite::Aes128Ctr => Engine::Ctr128(ctr::Ctr128BE::new(
                GenericArray::from_slice(key),
                GenericArray::from_slice(iv),
            )),
            CipherSuite::Aes192Ctr => Engine::Ctr192(ctr::Ctr128BE::new(
                GenericArray::from_slice(key),
                GenericArray::from_slice(iv),
            )),
            CipherSuite::Aes256Ctr => Engine::Ctr256(ctr::Ctr128BE::new(
                GenericArray::from_slice(key),
                GenericArray::from_slice(iv),
            )),
            CipherSuite::TripleDesCfb => {
                let cipher = des::TdesEde3::new(GenericArray::from_slice(key));
                Engine::Cfb3Des(Cfb::new(cipher, iv, direction))
            }
            CipherSuite::BlowfishCfb => {
                let cipher = blowfish::Blowfish::new(GenericArray::from_slice(key));
                Engine::CfbBlowfish(Cfb::new(cipher, iv, direction))
            }
        })
    }

    fn apply_inplace(&mut self, buf: &mut [u8]) {
        match self {
            Engine::Cfb128(c) => c.apply_inplace(buf),
            Engine::Cfb192(c) => c.apply_inplace(buf),
            Engine::Cfb256(c) => c.apply_inplace(buf),
            Engine::Ctr128(c) => c.apply_keystream(buf),
            Engine::Ctr192(c) => c.apply_keystream(buf),
            Engine::Ctr256(c) => c.apply_keystream(buf),
            Engine::Cfb3Des(c) => c.apply_inplace(buf),
            Engine::CfbBlowfish(c) => c.apply_inplace(buf),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    Pending,
    Processing,
    Done,
    Failed,
}

struct Slot {
    state: Mutex<SlotState>,
    buf: Mutex<Vec<u8>>,
    ready: Condvar,
    done: Condvar,
    failure: Mutex<Option<String>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Idle),
            buf: Mutex::new(Vec::new()),
            ready: Condvar::new(),
            done: Condvar::new(),
            failure: Mutex::new(None),
        }
    }
}

/// A direction-bound, multi-threaded cipher pipeline. One `Pipeline` is
/// constructed per transfer per direction (a sender encrypts, a receiver
/// decrypts); the suite, key, and IV are fixed for its lifetime.
pub struct Pipeline {
    slots: Arc<Vec<Slot>>,
    next_slot: AtomicUsize,
    poisoned: Arc<AtomicBool>,
    worker_count: usize,
}

impl Pipeline {
    /// Spawns `workers` threads, each owning an independently initialized
    /// [`Engine`] for `suite`, keyed with `key` and `iv`. All workers are
    /// registered with the global [`registry::Registry`] under the
    /// `Control` class: the pipeline is transfer-lifetime infrastructure,
    /// not the data-plane thread the watchdog drains on.
    pub fn new(
        suite: CipherSuite,
        key: &[u8],
        iv: &[u8],
        workers: usize,
        direction_is_encrypt: bool,
    ) -> Result<Self, CryptoError> {
        let direction = if direction_is_encrypt {
            Direction::Encrypt
        } else {
            Direction::Decrypt
        };
        // Validate the key up front so a bad configuration fails before any
        // thread is spawned, rather than surfacing as a worker failure.
        Engine::new(suite, key, iv, direction)?;

        let slots: Arc<Vec<Slot>> = Arc::new((0..workers).map(|_| Slot::new()).collect());
        let poisoned = Arc::new(AtomicBool::new(false));

        for slot_id in 0..workers {
            let slots = Arc::clone(&slots);
            let poisoned = Arc::clone(&poisoned);
            let key = key.to_vec();
            let iv = iv.to_vec();
            registry::Registry::global()
                .spawn(
                    format!("crypto-worker-{slot_id}"),
                    registry::Class::Control,
                    move |_handle| {
                        let mut engine = match Engine::new(suite, &key, &iv, direction) {
                            Ok(engine) => engine,
                            Err(err) => {
                                fail_slot(&slots[slot_id], &poisoned, err.to_string());
                                return;
                            }
                        };
                        worker_loop(&slots[slot_id], &poisoned, &mut engine);
                    },
                )
                .map_err(|err| CryptoError::WorkerFailed {
                    slot: slot_id,
                    reason: err.to_string(),
                })?;
        }

        Ok(Self {
            slots,
            next_slot: AtomicUsize::new(0),
            poisoned,
            worker_count: workers,
        })
    }

    /// Transforms `buf` in place, splitting it into `sub_block_len`-sized
    /// chunks and handing each to the next worker in round-robin order,
    /// then blocking until every chunk has come back.
    pub fn process(&self, buf: &mut [u8], sub_block_len: usize) -> Result<(), CryptoError> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(CryptoError::Poisoned);
        }
        if sub_block_len == 0 || buf.is_empty() {
            return Ok(());
        }

        let assigned: Vec<usize> = buf
            .chunks(sub_block_len)
            .map(|_| self.next_slot.fetch_add(1, Ordering::Relaxed) % self.worker_count)
            .collect();

        for (chunk, &slot_id) in buf.chunks(sub_block_len).zip(assigned.iter()) {
            self.submit(slot_id, chunk)?;
        }

        let mut offset = 0;
        for (chunk_len, &slot_id) in buf
            .chunks(sub_block_len)
            .map(<[u8]>::len)
            .collect::<Vec<_>>()
            .into_iter()
            .zip(assigned.iter())
        {
            let processed = self.drain(slot_id)?;
            buf[offset..offset + chunk_len].copy_from_slice(&processed);
            offset += chunk_len;
        }

        Ok(())
    }

    fn submit(&self, slot_id: usize, data: &[u8]) -> Result<(), CryptoError> {
        let slot = &self.slots[slot_id];
        let mut buf = slot.buf.lock().unwrap_or_else(|e| e.into_inner());
        buf.clear();
        buf.extend_from_slice(data);
        drop(buf);

        let mut state = slot.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = SlotState::Pending;
        slot.ready.notify_one();
        Ok(())
    }

    fn drain(&self, slot_id: usize) -> Result<Vec<u8>, CryptoError> {
        let slot = &self.slots[slot_id];
        let mut state = slot.state.lock().unwrap_or_else(|e| e.into_inner());
        while *state == SlotState::Pending || *state == SlotState::Processing {
            state = slot.done.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        match *state {
            SlotState::Done => {
                *state = SlotState::Idle;
                drop(state);
                Ok(slot.buf.lock().unwrap_or_else(|e| e.into_inner()).clone())
            }
            SlotState::Failed => {
                let reason = slot
                    .failure
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone()
                    .unwrap_or_else(|| "unknown cipher failure".to_string());
                Err(CryptoError::WorkerFailed {
                    slot: slot_id,
                    reason,
                })
            }
            // Idle with nothing submitted since the last drain: treat as a
            // no-op rather than blocking forever.
            SlotState::Idle => Ok(Vec::new()),
            SlotState::Pending | SlotState::Processing => unreachable!("loop condition above"),
        }
    }
}

fn worker_loop(slot: &Slot, poisoned: &AtomicBool, engine: &mut Engine) {
    loop {
        let mut state = slot.state.lock().unwrap_or_else(|e| e.into_inner());
        while *state != SlotState::Pending {
            if registry::Registry::global().is_shutting_down() && *state == SlotState::Idle {
                return;
            }
            state = slot.ready.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        *state = SlotState::Processing;
        drop(state);

        let result = {
            let mut buf = slot.buf.lock().unwrap_or_else(|e| e.into_inner());
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                engine.apply_inplace(&mut buf);
            }))
        };

        let mut state = slot.state.lock().unwrap_or_else(|e| e.into_inner());
        match result {
            Ok(()) => *state = SlotState::Done,
            Err(_) => {
                *slot.failure.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some("cipher block transform panicked".to_string());
                *state = SlotState::Failed;
                poisoned.store(true, Ordering::Release);
            }
        }
        drop(state);
        slot.done.notify_all();
    }
}

fn fail_slot(slot: &Slot, poisoned: &AtomicBool, reason: String) {
    *slot.failure.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason);
    *slot.state.lock().unwrap_or_else(|e| e.into_inner()) = SlotState::Failed;
    poisoned.store(true, Ordering::Release);
    slot.done.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aes128_cfb_round_trips() {
        let key = [0x42u8; 16];
        let iv = [0x24u8; 16];
        let encrypt = Pipeline::new(CipherSuite::Aes128Cfb, &key, &iv, 2, true).unwrap();
        let decrypt = Pipeline::new(CipherSuite::Aes128Cfb, &key, &iv, 2, false).unwrap();

        let mut data = b"the quick brown fox jumps over the lazy dog, quite a lot".to_vec();
        let original = data.clone();

        encrypt.process(&mut data, 16).unwrap();
        assert_ne!(data, original);

        decrypt.process(&mut data, 16).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn aes256_ctr_round_trips() {
        let key = [0x11u8; 32];
        let iv = [0x22u8; 16];
        let encrypt = Pipeline::new(CipherSuite::Aes256Ctr, &key, &iv, 3, true).unwrap();
        let decrypt = Pipeline::new(CipherSuite::Aes256Ctr, &key, &iv, 3, false).unwrap();

        let mut data = vec![7u8; 4096];
        let original = data.clone();

        encrypt.process(&mut data, 1024).unwrap();
        assert_ne!(data, original);
        decrypt.process(&mut data, 1024).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn blowfish_cfb_round_trips_with_partial_final_block() {
        let key = [0x9u8; 16];
        let iv = [0x1u8; 8];
        let encrypt = Pipeline::new(CipherSuite::BlowfishCfb, &key, &iv, 1, true).unwrap();
        let decrypt = Pipeline::new(CipherSuite::BlowfishCfb, &key, &iv, 1, false).unwrap();

        let mut data = b"13 bytes long".to_vec();
        let original = data.clone();
        encrypt.process(&mut data, 8).unwrap();
        assert_ne!(data, original);
        decrypt.process(&mut data, 8).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn rejects_wrong_key_length() {
        let err = Pipeline::new(CipherSuite::Aes256Cfb, &[0u8; 16], &[0u8; 16], 1, true)
            .unwrap_err();
        assert!(matches!(err, CryptoError::KeyLength { .. }));
    }

    #[test]
    fn triple_des_cfb_round_trips() {
        let key = [3u8; 24];
        let iv = [4u8; 8];
        let encrypt = Pipeline::new(CipherSuite::TripleDesCfb, &key, &iv, 2, true).unwrap();
        let decrypt = Pipeline::new(CipherSuite::TripleDesCfb, &key, &iv, 2, false).unwrap();

        let mut data = vec![0xABu8; 200];
        let original = data.clone();
        encrypt.process(&mut data, 24).unwrap();
        assert_ne!(data, original);
        decrypt.process(&mut data, 24).unwrap();
        assert_eq!(data, original);
    }
}
