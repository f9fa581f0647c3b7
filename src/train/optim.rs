//! AdamW over named parameter slots, with exportable moment state.
//!
//! Keeping the slots sorted by name makes the update order (and therefore
//! the floating-point results) independent of how the parameters were
//! collected, which is what lets a resumed run replay bit-identically.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};

const BETA1: f64 = 0.9;
const BETA2: f64 = 0.999;
const EPS: f64 = 1e-8;
const WEIGHT_DECAY: f64 = 0.01;

const STEP_KEY: &str = "step_t";

struct Slot {
    name: String,
    var: Var,
    first_moment: Var,
    second_moment: Var,
}

pub(crate) struct AdamW {
    slots: Vec<Slot>,
    learning_rate: f64,
    step_t: usize,
}

impl AdamW {
    pub(crate) fn new(
        params: Vec<(String, Var)>,
        learning_rate: f64,
    ) -> candle_core::Result<Self> {
        let mut slots = Vec::with_capacity(params.len());
        for (name, var) in params {
            let first_moment = Var::zeros(var.shape(), var.dtype(), var.device())?;
            let second_moment = Var::zeros(var.shape(), var.dtype(), var.device())?;
            slots.push(Slot {
                name,
                var,
                first_moment,
                second_moment,
            });
        }
        slots.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Self {
            slots,
            learning_rate,
            step_t: 0,
        })
    }

    pub(crate) fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        self.step_t += 1;
        let lr = self.learning_rate;
        let scale_m = 1.0 / (1.0 - BETA1.powi(self.step_t as i32));
        let scale_v = 1.0 / (1.0 - BETA2.powi(self.step_t as i32));
        for slot in &self.slots {
            let Some(grad) = grads.get(&slot.var) else {
                continue;
            };
            let next_m = ((slot.first_moment.as_tensor() * BETA1)? + (grad * (1.0 - BETA1))?)?;
            let next_v =
                ((slot.second_moment.as_tensor() * BETA2)? + (grad.sqr()? * (1.0 - BETA2))?)?;
            let m_hat = (&next_m * scale_m)?;
            let v_hat = (&next_v * scale_v)?;
            let decayed = (slot.var.as_tensor() * (1.0 - lr * WEIGHT_DECAY))?;
            let update = ((m_hat / (v_hat.sqrt()? + EPS)?)? * lr)?;
            slot.var.set(&(decayed - update)?)?;
            slot.first_moment.set(&next_m)?;
            slot.second_moment.set(&next_v)?;
        }
        Ok(())
    }

    pub(crate) fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub(crate) fn optimizer_steps(&self) -> usize {
        self.step_t
    }

    /// Moment tensors plus the step counter, keyed for a safetensors file.
    pub(crate) fn state_tensors(&self) -> candle_core::Result<HashMap<String, Tensor>> {
        let mut state = HashMap::with_capacity(self.slots.len() * 2 + 1);
        for slot in &self.slots {
            state.insert(
                format!("m.{}", slot.name),
                slot.first_moment.as_tensor().clone(),
            );
            state.insert(
                format!("v.{}", slot.name),
                slot.second_moment.as_tensor().clone(),
            );
        }
        let step = Tensor::from_vec(vec![self.step_t as i64], 1, &Device::Cpu)?;
        state.insert(STEP_KEY.to_string(), step);
        Ok(state)
    }

    /// Restores the exact moment state exported by [`Self::state_tensors`].
    ///
    /// Every slot must be covered and no unknown entries may remain; a
    /// partial or oversized state means the checkpoint belongs to a
    /// different parameter set.
    pub(crate) fn load_state_tensors(
        &mut self,
        mut state: HashMap<String, Tensor>,
    ) -> candle_core::Result<()> {
        let step = state.remove(STEP_KEY).ok_or_else(|| {
            candle_core::Error::Msg(format!("optimizer state is missing {STEP_KEY}"))
        })?;
        let steps = step.to_dtype(DType::I64)?.reshape(1)?.to_vec1::<i64>()?[0];
        if steps < 0 {
            return Err(candle_core::Error::Msg(format!(
                "optimizer step count {steps} is negative"
            )));
        }
        for slot in &self.slots {
            let m = state.remove(&format!("m.{}", slot.name)).ok_or_else(|| {
                candle_core::Error::Msg(format!("optimizer state is missing m.{}", slot.name))
            })?;
            let v = state.remove(&format!("v.{}", slot.name)).ok_or_else(|| {
                candle_core::Error::Msg(format!("optimizer state is missing v.{}", slot.name))
            })?;
            if m.shape() != slot.var.shape() || v.shape() != slot.var.shape() {
                return Err(candle_core::Error::Msg(format!(
                    "optimizer state shape mismatch for {}: expected {:?}, found m {:?} / v {:?}",
                    slot.name,
                    slot.var.shape(),
                    m.shape(),
                    v.shape()
                )));
            }
            slot.first_moment.set(&m.to_device(slot.var.device())?)?;
            slot.second_moment.set(&v.to_device(slot.var.device())?)?;
        }
        if let Some(extra) = state.keys().next() {
            return Err(candle_core::Error::Msg(format!(
                "optimizer state contains unknown entry {extra}"
            )));
        }
        self.step_t = steps as usize;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar_params(values: &[f32]) -> (Var, Vec<(String, Var)>) {
        let tensor = Tensor::from_vec(values.to_vec(), values.len(), &Device::Cpu)
            .expect("build parameter tensor");
        let var = Var::from_tensor(&tensor).expect("wrap parameter var");
        (var.clone(), vec![("w".to_string(), var)])
    }

    fn square_loss_grads(var: &Var) -> GradStore {
        let loss = var
            .as_tensor()
            .sqr()
            .and_then(|t| t.sum_all())
            .expect("build loss");
        loss.backward().expect("backward")
    }

    #[test]
    fn zero_learning_rate_leaves_parameters_bit_identical() {
        let (var, params) = scalar_params(&[0.5, -1.25, 2.0]);
        let before = var.as_tensor().to_vec1::<f32>().expect("read before");
        let mut optimizer = AdamW::new(params, 0.0).expect("build optimizer");
        let grads = square_loss_grads(&var);
        optimizer.step(&grads).expect("step");
        let after = var.as_tensor().to_vec1::<f32>().expect("read after");
        assert_eq!(before, after);
        assert_eq!(optimizer.optimizer_steps(), 1);
    }

    #[test]
    fn step_moves_parameters_against_the_gradient() {
        let (var, params) = scalar_params(&[1.0, 2.0]);
        let mut optimizer = AdamW::new(params, 0.1).expect("build optimizer");
        let grads = square_loss_grads(&var);
        optimizer.step(&grads).expect("step");
        let after = var.as_tensor().to_vec1::<f32>().expect("read after");
        assert!(after[0] < 1.0);
        assert!(after[1] < 2.0);
    }

    #[test]
    fn state_roundtrip_restores_moments_and_step_count() {
        let (var, params) = scalar_params(&[0.3, -0.7]);
        let mut optimizer = AdamW::new(params, 0.05).expect("build optimizer");
        optimizer.step(&square_loss_grads(&var)).expect("step");
        let exported = optimizer.state_tensors().expect("export state");

        // A restored optimizer starts from the checkpointed parameters.
        let fresh_var = Var::from_tensor(var.as_tensor()).expect("copy stepped params");
        let fresh_params = vec![("w".to_string(), fresh_var.clone())];
        let mut restored = AdamW::new(fresh_params, 0.05).expect("build restored optimizer");
        restored
            .load_state_tensors(exported)
            .expect("load exported state");
        assert_eq!(restored.optimizer_steps(), optimizer.optimizer_steps());

        // One more identical step on each must now produce identical params.
        optimizer.step(&square_loss_grads(&var)).expect("second step");
        restored
            .step(&square_loss_grads(&fresh_var))
            .expect("second restored step");
        assert_eq!(
            var.as_tensor().to_vec1::<f32>().expect("read original"),
            fresh_var.as_tensor().to_vec1::<f32>().expect("read restored"),
        );
    }

    #[test]
    fn incomplete_state_is_rejected() {
        let (var, params) = scalar_params(&[1.0]);
        let mut optimizer = AdamW::new(params, 0.01).expect("build optimizer");
        optimizer.step(&square_loss_grads(&var)).expect("step");

        let mut missing_moment = optimizer.state_tensors().expect("export");
        missing_moment.remove("m.w");
        assert!(optimizer.load_state_tensors(missing_moment).is_err());

        let mut missing_step = optimizer.state_tensors().expect("export");
        missing_step.remove(STEP_KEY);
        assert!(optimizer.load_state_tensors(missing_step).is_err());

        let mut extra_entry = optimizer.state_tensors().expect("export");
        extra_entry.insert(
            "m.ghost".to_string(),
            Tensor::zeros(1, DType::F32, &Device::Cpu).expect("ghost tensor"),
        );
        assert!(optimizer.load_state_tensors(extra_entry).is_err());
    }

    #[test]
    fn restored_state_must_match_parameter_shapes() {
        let (var, params) = scalar_params(&[1.0, 2.0]);
        let mut optimizer = AdamW::new(params, 0.01).expect("build optimizer");
        optimizer.step(&square_loss_grads(&var)).expect("step");
        let mut state = optimizer.state_tensors().expect("export");
        state.insert(
            "m.w".to_string(),
            Tensor::zeros(3, DType::F32, &Device::Cpu).expect("wrong-shape tensor"),
        );
        assert!(optimizer.load_state_tensors(state).is_err());
    }
}
