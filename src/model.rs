use burn::{
    config::Config,
    module::Module,
    nn::{Linear, LinearConfig, Relu},
    tensor::{activation::softmax, backend::Backend, Tensor},
};
use serde::{Deserialize, Serialize};

use crate::data::{FLAT_DIM, NUM_CLASSES};

/// Fixed two-layer architecture: Dense(512, relu) over 784-wide inputs
/// followed by Dense(10, softmax). Nothing is tunable from the outside;
/// `ModelConfig::new()` takes no arguments.
#[derive(Config, Debug)]
pub struct ModelConfig {
    #[config(default = 784)]
    pub input_width: usize,
    #[config(default = 512)]
    pub hidden_size: usize,
    #[config(default = 10)]
    pub num_classes: usize,
}

impl ModelConfig {
    /// Returns the initialized model.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Model<B> {
        Model {
            linear1: LinearConfig::new(self.input_width, self.hidden_size).init(device),
            linear2: LinearConfig::new(self.hidden_size, self.num_classes).init(device),
            activation: Relu::new(),
        }
    }
}

#[derive(Module, Debug)]
pub struct Model<B: Backend> {
    linear1: Linear<B>,
    linear2: Linear<B>,
    activation: Relu,
}

impl<B: Backend> Model<B> {
    /// # Shapes
    ///   - Input [batch_size, 784]
    ///   - Output [batch_size, 10] (logits)
    pub fn forward(&self, images: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.linear1.forward(images);
        let x = self.activation.forward(x);

        self.linear2.forward(x)
    }

    /// Class probabilities: softmax over the logits of [`Self::forward`].
    pub fn predict(&self, images: Tensor<B, 2>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// Structured layer descriptions for the `model.json` artifact.
    pub fn architecture(&self) -> ModelArchitecture {
        ModelArchitecture {
            layers: vec![
                LayerDescription::from_linear("dense_1", &self.linear1, "relu"),
                LayerDescription::from_linear("dense_2", &self.linear2, "softmax"),
            ],
        }
    }

    /// Human-readable layer table for the `model_summary.txt` artifact.
    pub fn summary(&self) -> String {
        let arch = self.architecture();
        let mut lines = Vec::new();
        lines.push(format!(
            "{:<20} {:<16} {:>10}",
            "Layer (type)", "Output Shape", "Param #"
        ));
        lines.push("=".repeat(48));
        for layer in &arch.layers {
            lines.push(format!(
                "{:<20} {:<16} {:>10}",
                format!("{} (Linear)", layer.name),
                format!("(None, {})", layer.units),
                layer.params
            ));
        }
        lines.push("=".repeat(48));
        lines.push(format!("Total params: {}", self.num_params()));
        lines.join("\n")
    }
}

/// Serializable description of one dense layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerDescription {
    pub name: String,
    pub kind: String,
    pub input_width: usize,
    pub units: usize,
    pub activation: String,
    pub params: usize,
}

impl LayerDescription {
    fn from_linear<B: Backend>(name: &str, linear: &Linear<B>, activation: &str) -> Self {
        let [input_width, units] = linear.weight.val().dims();
        let params = input_width * units + units;

        Self {
            name: name.to_string(),
            kind: "Linear".to_string(),
            input_width,
            units,
            activation: activation.to_string(),
            params,
        }
    }
}

/// The ordered list of layers making up the model, as written to `model.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArchitecture {
    pub layers: Vec<LayerDescription>,
}
