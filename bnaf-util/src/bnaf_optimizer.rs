#![allow(dead_code)]

use candle_core::backprop::GradStore;
use candle_core::{Result, Tensor, Var};
use std::collections::HashMap;

/// Which parameter trajectory is currently stored in the model variables
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParameterView {
    /// the raw optimization trajectory
    Raw,
    /// the Polyak/EMA-averaged trajectory
    Averaged,
}

#[derive(Clone, Debug)]
pub struct ParamsPolyakAdam {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    /// EMA coefficient for the averaged trajectory
    pub polyak: f64,
}

impl Default for ParamsPolyakAdam {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            polyak: 0.998,
        }
    }
}

struct TrackedVar {
    name: String,
    var: Var,
    exp_avg: Tensor,    // first moment
    exp_avg_sq: Tensor, // second moment
    shadow: Tensor,     // the trajectory not currently live in `var`
}

/// Adam with bias-corrected moments plus a Polyak-averaged shadow copy of
/// every parameter. `swap` exchanges the live parameters with the shadow so
/// validation and checkpointing can run under the averaged trajectory while
/// training resumes from the raw one.
pub struct PolyakAdam {
    tracked: Vec<TrackedVar>,
    params: ParamsPolyakAdam,
    step_count: usize,
    view: ParameterView,
}

impl PolyakAdam {
    pub fn new(named_vars: Vec<(String, Var)>, params: ParamsPolyakAdam) -> Result<Self> {
        let mut named_vars = named_vars;
        named_vars.sort_by(|a, b| a.0.cmp(&b.0));

        let tracked = named_vars
            .into_iter()
            .map(|(name, var)| {
                let exp_avg = var.zeros_like()?;
                let exp_avg_sq = var.zeros_like()?;
                let shadow = var.as_tensor().copy()?;
                Ok(TrackedVar {
                    name,
                    var,
                    exp_avg,
                    exp_avg_sq,
                    shadow,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            tracked,
            params,
            step_count: 0,
            view: ParameterView::Raw,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    pub fn active_view(&self) -> ParameterView {
        self.view
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }

    /// Global L2 norm of the gradients of all tracked variables
    pub fn global_grad_norm(&self, grads: &GradStore) -> Result<f64> {
        let mut total = 0f64;
        for tv in self.tracked.iter() {
            if let Some(grad) = grads.get(tv.var.as_tensor()) {
                total += grad.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
            }
        }
        Ok(total.sqrt())
    }

    /// Scale that brings a gradient of norm `norm` inside `max_norm`
    pub fn clip_scale(norm: f64, max_norm: f64) -> f64 {
        if norm > max_norm {
            max_norm / (norm + 1e-6)
        } else {
            1.0
        }
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step_clipped(grads, None)
    }

    /// One Adam update, with the gradients rescaled so their global norm does
    /// not exceed `max_norm` when given.
    pub fn step_clipped(&mut self, grads: &GradStore, max_norm: Option<f64>) -> Result<()> {
        if self.view != ParameterView::Raw {
            candle_core::bail!("optimizer step requires the raw parameter view; call swap() first")
        }

        let scale = match max_norm {
            Some(max_norm) => Self::clip_scale(self.global_grad_norm(grads)?, max_norm),
            None => 1.0,
        };

        self.step_count += 1;
        let b1 = self.params.beta1;
        let b2 = self.params.beta2;
        let bias1 = 1.0 - b1.powi(self.step_count as i32);
        let bias2 = 1.0 - b2.powi(self.step_count as i32);

        for tv in self.tracked.iter_mut() {
            if let Some(grad) = grads.get(tv.var.as_tensor()) {
                let grad = if scale != 1.0 {
                    (grad * scale)?
                } else {
                    grad.clone()
                };

                tv.exp_avg = ((&tv.exp_avg * b1)? + (&grad * (1.0 - b1))?)?;
                tv.exp_avg_sq = ((&tv.exp_avg_sq * b2)? + (grad.sqr()? * (1.0 - b2))?)?;

                let m_hat = (&tv.exp_avg / bias1)?;
                let v_hat = (&tv.exp_avg_sq / bias2)?;
                let delta = (m_hat * self.params.lr)?.div(&(v_hat.sqrt()? + self.params.eps)?)?;

                tv.var.set(&tv.var.sub(&delta)?)?;
                tv.shadow = ((&tv.shadow * self.params.polyak)?
                    + (tv.var.as_tensor() * (1.0 - self.params.polyak))?)?;
            }
        }
        Ok(())
    }

    /// Exchange the live parameters with the shadow trajectory and flip the
    /// active view.
    pub fn swap(&mut self) -> Result<()> {
        for tv in self.tracked.iter_mut() {
            let live = tv.var.as_tensor().copy()?;
            tv.var.set(&tv.shadow)?;
            tv.shadow = live;
        }
        self.view = match self.view {
            ParameterView::Raw => ParameterView::Averaged,
            ParameterView::Averaged => ParameterView::Raw,
        };
        Ok(())
    }

    /// Named state tensors for checkpointing; requires the raw view so the
    /// shadow holds the averaged trajectory.
    pub fn state_tensors(&self) -> Result<Vec<(String, Tensor)>> {
        if self.view != ParameterView::Raw {
            candle_core::bail!("optimizer state must be captured under the raw parameter view")
        }
        let mut out = Vec::with_capacity(3 * self.tracked.len() + 1);
        for tv in self.tracked.iter() {
            out.push((format!("optimizer::{}::exp_avg", tv.name), tv.exp_avg.clone()));
            out.push((
                format!("optimizer::{}::exp_avg_sq", tv.name),
                tv.exp_avg_sq.clone(),
            ));
            out.push((format!("optimizer::{}::shadow", tv.name), tv.shadow.clone()));
        }
        out.push((
            "optimizer::step".to_string(),
            Tensor::from_vec(vec![self.step_count as u32], 1, &candle_core::Device::Cpu)?,
        ));
        Ok(out)
    }

    /// Restore moments, shadow parameters and the step counter from a
    /// checkpoint tensor map; any missing or misshaped entry aborts.
    pub fn load_state(&mut self, tensors: &HashMap<String, Tensor>) -> Result<()> {
        if self.view != ParameterView::Raw {
            candle_core::bail!("optimizer state must be restored under the raw parameter view")
        }

        let fetch = |key: &str, dims: &[usize]| -> Result<Tensor> {
            match tensors.get(key) {
                Some(t) if t.dims() == dims => Ok(t.clone()),
                Some(t) => candle_core::bail!(
                    "checkpoint tensor `{}` has shape {:?}, expected {:?}",
                    key,
                    t.dims(),
                    dims
                ),
                None => candle_core::bail!("checkpoint missing optimizer tensor `{}`", key),
            }
        };

        for tv in self.tracked.iter_mut() {
            let device = tv.var.device().clone();
            let dims = tv.var.dims().to_vec();
            tv.exp_avg = fetch(&format!("optimizer::{}::exp_avg", tv.name), &dims)?
                .to_device(&device)?;
            tv.exp_avg_sq = fetch(&format!("optimizer::{}::exp_avg_sq", tv.name), &dims)?
                .to_device(&device)?;
            tv.shadow =
                fetch(&format!("optimizer::{}::shadow", tv.name), &dims)?.to_device(&device)?;
        }

        let step = fetch("optimizer::step", &[1])?.to_vec1::<u32>()?;
        self.step_count = step[0] as usize;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::{DType, Device};

    fn quadratic_setup(init: f32) -> Result<(Var, Vec<(String, Var)>)> {
        let dev = Device::Cpu;
        let theta = Var::from_tensor(&Tensor::from_vec(vec![init, -init], 2, &dev)?)?;
        let named = vec![("theta".to_string(), theta.clone())];
        Ok((theta, named))
    }

    #[test]
    fn adam_descends_a_quadratic() -> Result<()> {
        let (theta, named) = quadratic_setup(2.0)?;
        let mut opt = PolyakAdam::new(
            named,
            ParamsPolyakAdam {
                lr: 0.1,
                ..Default::default()
            },
        )?;

        for _ in 0..100 {
            let loss = theta.as_tensor().sqr()?.sum_all()?;
            let grads = loss.backward()?;
            opt.step(&grads)?;
        }
        let loss = theta.as_tensor().sqr()?.sum_all()?.to_scalar::<f32>()?;
        assert!(loss < 0.1, "loss = {} did not decrease", loss);
        Ok(())
    }

    #[test]
    fn clip_scale_caps_the_global_norm() {
        assert_abs_diff_eq!(PolyakAdam::clip_scale(0.5, 1.0), 1.0);
        let scale = PolyakAdam::clip_scale(1e6, 1.0);
        assert!((1e6 * scale - 1.0).abs() < 1e-3);
    }

    #[test]
    fn clipped_step_is_bounded_under_huge_gradients() -> Result<()> {
        let (theta, named) = quadratic_setup(0.0)?;
        let mut opt = PolyakAdam::new(
            named,
            ParamsPolyakAdam {
                lr: 0.01,
                ..Default::default()
            },
        )?;

        // gradient of 1e6 * sum(theta) has norm ~ 1.4e6
        let loss = (theta.as_tensor() * 1e6)?.sum_all()?;
        let grads = loss.backward()?;
        assert!(opt.global_grad_norm(&grads)? > 1e5);

        opt.step_clipped(&grads, Some(1.0))?;

        // first Adam step magnitude is at most lr per coordinate
        for v in theta.as_tensor().to_vec1::<f32>()? {
            assert!(v.abs() <= 0.011, "update {} exceeds the lr bound", v);
        }
        Ok(())
    }

    #[test]
    fn swap_round_trip_restores_raw_parameters() -> Result<()> {
        let (theta, named) = quadratic_setup(1.0)?;
        let mut opt = PolyakAdam::new(named, ParamsPolyakAdam::default())?;

        for _ in 0..3 {
            let loss = theta.as_tensor().sqr()?.sum_all()?;
            let grads = loss.backward()?;
            opt.step(&grads)?;
        }

        let raw = theta.as_tensor().to_vec1::<f32>()?;
        assert_eq!(opt.active_view(), ParameterView::Raw);

        opt.swap()?;
        assert_eq!(opt.active_view(), ParameterView::Averaged);
        let averaged = theta.as_tensor().to_vec1::<f32>()?;
        assert_ne!(raw, averaged, "averaged trajectory should differ");

        opt.swap()?;
        assert_eq!(opt.active_view(), ParameterView::Raw);
        assert_eq!(theta.as_tensor().to_vec1::<f32>()?, raw);
        Ok(())
    }

    #[test]
    fn stepping_under_averaged_view_is_rejected() -> Result<()> {
        let (theta, named) = quadratic_setup(1.0)?;
        let mut opt = PolyakAdam::new(named, ParamsPolyakAdam::default())?;
        opt.swap()?;

        let loss = theta.as_tensor().sqr()?.sum_all()?;
        let grads = loss.backward()?;
        assert!(opt.step(&grads).is_err());
        Ok(())
    }

    #[test]
    fn state_round_trip() -> Result<()> {
        let (theta, named) = quadratic_setup(1.5)?;
        let mut opt = PolyakAdam::new(named, ParamsPolyakAdam::default())?;
        for _ in 0..5 {
            let loss = theta.as_tensor().sqr()?.sum_all()?;
            let grads = loss.backward()?;
            opt.step(&grads)?;
        }

        let state: HashMap<String, Tensor> = opt.state_tensors()?.into_iter().collect();

        // detach from theta's storage; Var::from_tensor on a variable aliases
        let theta2 = Var::from_tensor(&theta.as_tensor().copy()?)?;
        let mut opt2 = PolyakAdam::new(
            vec![("theta".to_string(), theta2.clone())],
            ParamsPolyakAdam::default(),
        )?;
        opt2.load_state(&state)?;
        assert_eq!(opt2.step_count(), 5);

        // both copies must take the same next step
        let step_of = |theta: &Var, opt: &mut PolyakAdam| -> Result<Vec<f32>> {
            let loss = theta.as_tensor().sqr()?.sum_all()?;
            let grads = loss.backward()?;
            opt.step(&grads)?;
            theta.as_tensor().to_vec1::<f32>()
        };
        let a = step_of(&theta, &mut opt)?;
        let b = step_of(&theta2, &mut opt2)?;
        assert_eq!(a, b);
        Ok(())
    }
}
