use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Args;
use log::info;

use crate::candle_flow_chain::FlowType;
use crate::candle_flow_vae::{FlowVae, FlowVaeArgs};
use crate::candle_reparameterize::SeededNoise;

#[derive(Args, Debug)]
pub struct ForwardArgs {
    #[arg(long, default_value = "4", help = "Observation width")]
    pub input_size: usize,

    #[arg(long, value_delimiter = ',', default_value = "16,8", help = "Encoder trunk widths; the last is the bottleneck")]
    pub encoder_sizes: Vec<usize>,

    #[arg(long, value_delimiter = ',', default_value = "8,16", help = "Decoder hidden widths")]
    pub decoder_sizes: Vec<usize>,

    #[arg(short, long, default_value = "2")]
    pub z_size: usize,

    #[arg(short, long, default_value = "planar")]
    pub flow: FlowType,

    #[arg(short = 'k', long, default_value = "4", help = "Number of flow steps (0 = plain Gaussian)")]
    pub num_flows: usize,

    #[arg(long, default_value = "320", help = "IAF context width")]
    pub made_h_size: usize,

    #[arg(long, default_value = "1", help = "Masked hidden layers per IAF step")]
    pub made_num_hidden: usize,

    #[arg(long)]
    pub batch_norm: bool,

    #[arg(long, default_value = "0")]
    pub dropout: f32,

    #[arg(short, long, default_value = "8", help = "Rows of synthetic N(0,1) input")]
    pub batch_size: usize,

    #[arg(long, default_value = "42")]
    pub seed: u64,

    #[arg(long, help = "Metal on macOS, CUDA on Linux; falls back to CPU")]
    pub gpu: bool,
}

fn summarize(name: &str, x: &Tensor) -> Result<()> {
    let x64 = x.to_dtype(DType::F64)?;
    info!(
        "  {:<8} {:?}  mean {:.4}  min {:.4}  max {:.4}",
        name,
        x.dims(),
        x64.mean_all()?.to_scalar::<f64>()?,
        x64.min_all()?.to_scalar::<f64>()?,
        x64.max_all()?.to_scalar::<f64>()?,
    );
    Ok(())
}

/// Build a freshly initialized model and push one synthetic batch
/// through it.
pub fn run(args: &ForwardArgs) -> Result<()> {
    let device = if args.gpu {
        #[cfg(target_os = "macos")]
        { Device::new_metal(0).unwrap_or(Device::Cpu) }
        #[cfg(target_os = "linux")]
        { Device::new_cuda(0).unwrap_or(Device::Cpu) }
        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        { Device::Cpu }
    } else {
        Device::Cpu
    };
    info!("Using device: {:?}", device);

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

    let model = FlowVae::new(
        FlowVaeArgs {
            input_size: args.input_size,
            encoder_sizes: &args.encoder_sizes,
            decoder_sizes: &args.decoder_sizes,
            z_size: args.z_size,
            batch_norm: args.batch_norm,
            dropout: args.dropout,
            num_flows: args.num_flows,
            made_h_size: args.made_h_size,
            made_num_hidden: args.made_num_hidden,
            flow: args.flow,
        },
        vb,
    )?;
    info!(
        "Built {:?} chain with {} step(s), {} trainable tensors",
        model.chain().flow_type(),
        args.num_flows,
        varmap.all_vars().len()
    );

    let x_nd = Tensor::randn(0f32, 1f32, (args.batch_size, args.input_size), &device)?;
    let mut noise = SeededNoise::new(args.seed);

    let (out, trajectory) = model.forward_with_trajectory(&x_nd, &mut noise, false)?;
    info!("Trajectory length: {}", trajectory.len());

    summarize("x_mean", &out.x_mean)?;
    summarize("mu", &out.mu)?;
    summarize("var", &out.var)?;
    summarize("z0", &out.z0)?;
    summarize("zk", &out.zk)?;
    summarize("log_det", &out.log_det)?;
    Ok(())
}
