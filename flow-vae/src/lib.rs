pub mod candle_aux_layers;
pub mod candle_flow_chain;
pub mod candle_flow_error;
pub mod candle_flow_iaf;
pub mod candle_flow_planar;
pub mod candle_flow_vae;
pub mod candle_masked_linear;
pub mod candle_model_decoder;
pub mod candle_model_encoder;
pub mod candle_model_traits;
pub mod candle_numerics;
pub mod candle_posterior_head;
pub mod candle_reparameterize;
pub mod cli;

pub use candle_core;
pub use candle_nn;

pub use candle_flow_chain::{FlowChain, FlowType};
pub use candle_flow_error::FlowVaeError;
pub use candle_flow_vae::{FlowVae, FlowVaeArgs, FlowVaeOutput};
pub use candle_reparameterize::{DeviceNoise, NoiseSource, SeededNoise};
