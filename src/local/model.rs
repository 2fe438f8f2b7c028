//! Local models trained on a participant's own windows.

use crate::core::{Error, Result};
use crate::federated::tensor::ParameterVector;
use crate::local::dataset::SequenceDataset;
use ndarray::{Array1, Array2, ArrayView2, Ix2};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Summary of one call to [`LocalModel::train`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingResult {
    /// Mean loss over the last epoch
    pub loss: f64,
    /// Windows seen per epoch
    pub samples_trained: usize,
    /// Epochs completed
    pub epochs: usize,
}

/// Loss and accuracy on a held-out set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelEvaluation {
    pub loss: f64,
    pub accuracy: f64,
}

/// A trainable model whose weights round-trip through [`ParameterVector`].
pub trait LocalModel: Clone + Send + Sync + 'static {
    /// Current weights.
    fn parameters(&self) -> ParameterVector;

    /// Replace the weights. Shapes must match [`LocalModel::parameters`].
    fn set_parameters(&mut self, parameters: &ParameterVector) -> Result<()>;

    /// Mini-batch training over `data`.
    fn train(
        &mut self,
        data: &SequenceDataset,
        epochs: usize,
        batch_size: usize,
    ) -> Result<TrainingResult>;

    /// Score `data` without changing the model.
    fn evaluate(&self, data: &SequenceDataset) -> Result<ModelEvaluation>;
}

/// Logistic classifier over a flattened `[seq_length, features]` window.
///
/// Parameters are two tensors: weights `[seq_length, features]` and
/// bias `[1]`. Trained with binary cross-entropy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SequenceClassifier {
    weights: Array2<f32>,
    bias: f32,
    learning_rate: f32,
}

impl SequenceClassifier {
    /// Create with small random weights.
    pub fn new(seq_length: usize, num_features: usize) -> Self {
        let mut rng = rand::thread_rng();
        let scale = (2.0 / (seq_length * num_features).max(1) as f32).sqrt();
        let weights = Array2::from_shape_fn((seq_length, num_features), |_| {
            rng.gen::<f32>() * scale - scale / 2.0
        });
        Self {
            weights,
            bias: 0.0,
            learning_rate: 0.05,
        }
    }

    /// Create with all-zero weights.
    pub fn zeros(seq_length: usize, num_features: usize) -> Self {
        Self {
            weights: Array2::zeros((seq_length, num_features)),
            bias: 0.0,
            learning_rate: 0.05,
        }
    }

    /// Set learning rate.
    pub fn with_learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// Probability of the positive class.
    pub fn predict(&self, window: ArrayView2<'_, f32>) -> f32 {
        let z = (&window * &self.weights).sum() + self.bias;
        1.0 / (1.0 + (-z).exp())
    }

    fn check_input(&self, data: &SequenceDataset) -> Result<()> {
        if data.is_empty() {
            return Err(Error::Dataset("no windows".into()));
        }
        let expected = self.weights.dim();
        if (data.seq_length(), data.num_features()) != expected {
            return Err(Error::Dataset(format!(
                "windows are {}x{}, model expects {}x{}",
                data.seq_length(),
                data.num_features(),
                expected.0,
                expected.1
            )));
        }
        Ok(())
    }
}

fn binary_cross_entropy(probability: f32, label: u8) -> f64 {
    let p = (probability as f64).clamp(1e-7, 1.0 - 1e-7);
    if label > 0 {
        -p.ln()
    } else {
        -(1.0 - p).ln()
    }
}

impl LocalModel for SequenceClassifier {
    fn parameters(&self) -> ParameterVector {
        ParameterVector::new(vec![
            self.weights.clone().into_dyn(),
            Array1::from_elem(1, self.bias).into_dyn(),
        ])
    }

    fn set_parameters(&mut self, parameters: &ParameterVector) -> Result<()> {
        self.parameters().check_shapes(parameters)?;
        let tensors = parameters.tensors();
        self.weights = tensors[0]
            .clone()
            .into_dimensionality::<Ix2>()
            .map_err(|e| Error::InvalidUpdate(e.to_string()))?;
        self.bias = tensors[1].iter().next().copied().unwrap_or(0.0);
        Ok(())
    }

    fn train(
        &mut self,
        data: &SequenceDataset,
        epochs: usize,
        batch_size: usize,
    ) -> Result<TrainingResult> {
        self.check_input(data)?;
        let batch_size = batch_size.max(1);
        let indices: Vec<usize> = (0..data.len()).collect();
        let mut epoch_loss = 0.0;

        for _epoch in 0..epochs {
            let mut total = 0.0;
            for batch in indices.chunks(batch_size) {
                let mut grad_w = Array2::<f32>::zeros(self.weights.dim());
                let mut grad_b = 0.0f32;

                for &i in batch {
                    let window = data.window(i);
                    let p = self.predict(window);
                    let label = data.label(i);
                    total += binary_cross_entropy(p, label);

                    let error = p - label as f32;
                    grad_w.scaled_add(error, &window);
                    grad_b += error;
                }

                let step = self.learning_rate / batch.len() as f32;
                self.weights.scaled_add(-step, &grad_w);
                self.bias -= step * grad_b;
            }
            epoch_loss = total / data.len() as f64;
        }

        Ok(TrainingResult {
            loss: epoch_loss,
            samples_trained: data.len(),
            epochs,
        })
    }

    fn evaluate(&self, data: &SequenceDataset) -> Result<ModelEvaluation> {
        self.check_input(data)?;
        let mut loss = 0.0;
        let mut correct = 0usize;
        for i in 0..data.len() {
            let p = self.predict(data.window(i));
            let label = data.label(i);
            loss += binary_cross_entropy(p, label);
            if (p >= 0.5) == (label > 0) {
                correct += 1;
            }
        }
        Ok(ModelEvaluation {
            loss: loss / data.len() as f64,
            accuracy: correct as f64 / data.len() as f64,
        })
    }
}
