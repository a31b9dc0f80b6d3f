//! Temporal aggregation over per-frame features.

use candle_core::{Module, Result, Tensor, D};
use candle_nn::rnn::{Direction, LSTMConfig};
use candle_nn::{linear, lstm, Linear, VarBuilder, LSTM, RNN};

/// Single-layer bidirectional LSTM, batch-first.
///
/// Weights use the `weight_ih_l0` / `weight_ih_l0_reverse` naming of a
/// bidirectional torch LSTM under one prefix.
#[derive(Debug, Clone)]
pub struct BiLstm {
    forward: LSTM,
    backward: LSTM,
    hidden: usize,
}

impl BiLstm {
    pub fn new(in_dim: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        let forward = lstm(in_dim, hidden, LSTMConfig::default(), vb.clone())?;
        let backward = lstm(
            in_dim,
            hidden,
            LSTMConfig {
                direction: Direction::Backward,
                ..Default::default()
            },
            vb,
        )?;
        Ok(Self {
            forward,
            backward,
            hidden,
        })
    }

    #[must_use]
    pub fn output_dim(&self) -> usize {
        2 * self.hidden
    }

    /// `(B, T, F)` to `(B, T, 2H)`: forward and backward hidden states
    /// concatenated per time step.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let steps = x.dim(1)?;
        let fwd_states = self.forward.seq(x)?;
        let fwd = self.forward.states_to_tensor(&fwd_states)?;

        let reverse: Vec<u32> = (0..steps as u32).rev().collect();
        let reverse = Tensor::from_vec(reverse, steps, x.device())?;
        let reversed = x.index_select(&reverse, 1)?;
        let mut bwd_states = self.backward.seq(&reversed)?;
        bwd_states.reverse();
        let bwd = self.backward.states_to_tensor(&bwd_states)?;

        Tensor::cat(&[fwd, bwd], D::Minus1)
    }
}

/// Single-head scaled dot-product self-attention without output projection.
#[derive(Debug, Clone)]
pub struct SelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    scale: f64,
}

impl SelfAttention {
    pub fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            query: linear(dim, dim, vb.pp("query"))?,
            key: linear(dim, dim, vb.pp("key"))?,
            value: linear(dim, dim, vb.pp("value"))?,
            scale: 1.0 / (dim as f64).sqrt(),
        })
    }

    /// `(B, T, D)` to `(B, T, D)`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let q = self.query.forward(x)?;
        let k = self.key.forward(x)?;
        let v = self.value.forward(x)?;
        let scores = (q.matmul(&k.t()?)? * self.scale)?;
        let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
        weights.matmul(&v)
    }
}

/// BiLSTM, then self-attention, then the mean over time.
#[derive(Debug, Clone)]
pub struct TemporalAggregator {
    lstm: BiLstm,
    attention: SelfAttention,
}

impl TemporalAggregator {
    pub fn new(in_dim: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        let lstm = BiLstm::new(in_dim, hidden, vb.pp("lstm"))?;
        let attention = SelfAttention::new(lstm.output_dim(), vb.pp("attention"))?;
        Ok(Self { lstm, attention })
    }

    #[must_use]
    pub fn output_dim(&self) -> usize {
        self.lstm.output_dim()
    }

    /// `(B, T, F)` to `(B, 2H)`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.lstm.forward(x)?;
        let h = self.attention.forward(&h)?;
        h.mean(1)
    }
}
