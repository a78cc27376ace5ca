//! kforge CLI: build and launch JIT compute kernels from the command line.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kforge_core::{CompilerSettings, Device, Dim3, KernelArg, KernelBackend, KernelInfo};

#[derive(Parser)]
#[command(name = "kforge")]
#[command(author = "Kernelforge Team")]
#[command(version)]
#[command(about = "JIT compute-kernel runtime CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, ValueEnum)]
enum BackendArg {
    HostShared,
    CrossVendor,
    DriverCompute,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a device and report what the backend knows about it.
    Info {
        #[arg(long, value_enum, default_value = "host-shared")]
        backend: BackendArg,
        #[arg(long, default_value_t = 0)]
        platform: i32,
        #[arg(long, default_value_t = 0)]
        device: i32,
    },

    /// Build a kernel from source and report whether it came from cache.
    Build {
        #[command(flatten)]
        device_args: DeviceArgs,
        /// Path to the kernel source file.
        source: PathBuf,
        /// Entry point function name.
        function: String,
    },

    /// Build (or reuse) a kernel, launch it once, and report elapsed time.
    ///
    /// Launch arguments are assembled in this fixed order: every `--scalar`
    /// value, then every `--in` buffer (loaded from the given file), then
    /// every `--out` buffer (`path:bytes`, written back after the launch).
    Run {
        #[command(flatten)]
        device_args: DeviceArgs,
        source: PathBuf,
        function: String,

        #[arg(long = "grid", default_value = "1,1,1")]
        grid: String,
        #[arg(long = "block", default_value = "1,1,1")]
        block: String,

        #[arg(long = "scalar")]
        scalars: Vec<i32>,
        #[arg(long = "in")]
        inputs: Vec<PathBuf>,
        /// `path:bytes`, e.g. `out.bin:1024`.
        #[arg(long = "out")]
        outputs: Vec<String>,

        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::Args)]
struct DeviceArgs {
    #[arg(long, value_enum, default_value = "host-shared")]
    backend: BackendArg,
    #[arg(long, default_value_t = 0)]
    platform: i32,
    #[arg(long, default_value_t = 0)]
    device: i32,
    /// Defaults per backend: `cc` (host-shared), the vendor OpenCL
    /// compiler (cross-vendor, usually unused), `nvcc` (driver-compute).
    #[arg(long)]
    compiler: Option<String>,
    #[arg(long = "compiler-flags", default_value = "")]
    compiler_flags: String,
    #[arg(long = "cache-dir")]
    cache_dir: Option<PathBuf>,
}

fn open_backend(backend: &BackendArg, platform: i32, device: i32) -> Result<Arc<dyn KernelBackend>> {
    match backend {
        BackendArg::HostShared => {
            #[cfg(feature = "host-shared")]
            {
                Ok(kforge_backends::open_host_shared(platform, device)?)
            }
            #[cfg(not(feature = "host-shared"))]
            bail!("this binary was built without the host-shared backend");
        }
        BackendArg::CrossVendor => {
            #[cfg(feature = "cross-vendor")]
            {
                Ok(kforge_backends::open_cross_vendor(platform, device)?)
            }
            #[cfg(not(feature = "cross-vendor"))]
            bail!("this binary was built without the cross-vendor backend");
        }
        BackendArg::DriverCompute => {
            #[cfg(feature = "driver-compute")]
            {
                Ok(kforge_backends::open_driver_compute(device)?)
            }
            #[cfg(not(feature = "driver-compute"))]
            bail!("this binary was built without the driver-compute backend");
        }
    }
}

fn default_compiler(backend: &BackendArg) -> &'static str {
    match backend {
        BackendArg::HostShared => "cc",
        BackendArg::CrossVendor => "cc",
        BackendArg::DriverCompute => "nvcc",
    }
}

/// `(compiler, flags)` environment variable names for a backend, per
/// SPEC_FULL.md §4.8. Cross-vendor has no compiler-binary env var since
/// the OpenCL runtime itself drives compilation.
fn env_var_names(backend: &BackendArg) -> (Option<&'static str>, &'static str) {
    match backend {
        BackendArg::HostShared => (Some("KFORGE_CPU_COMPILER"), "KFORGE_CPU_COMPILER_FLAGS"),
        BackendArg::CrossVendor => (None, "KFORGE_OPENCL_COMPILER_FLAGS"),
        BackendArg::DriverCompute => (Some("KFORGE_CUDA_COMPILER"), "KFORGE_CUDA_COMPILER_FLAGS"),
    }
}

/// Layers compiler settings: CLI flag > environment variable > built-in
/// default (§4.8).
fn open_device(args: &DeviceArgs) -> Result<Device> {
    let backend = open_backend(&args.backend, args.platform, args.device)?;
    let (compiler_var, flags_var) = env_var_names(&args.backend);

    let compiler = args.compiler.clone().or_else(|| {
        compiler_var.and_then(|v| std::env::var(v).ok())
    }).unwrap_or_else(|| default_compiler(&args.backend).to_string());

    let flags = if args.compiler_flags.is_empty() {
        std::env::var(flags_var).unwrap_or_default()
    } else {
        args.compiler_flags.clone()
    };

    let compiler = CompilerSettings {
        compiler,
        env_prelude: String::new(),
        flags,
    };

    match &args.cache_dir {
        Some(dir) => Ok(Device::with_cache_dir(backend, compiler, dir.clone())?),
        None => Ok(Device::new(backend, compiler)?),
    }
}

fn parse_dim3(s: &str) -> Result<Dim3> {
    let parts: Vec<usize> = s
        .split(',')
        .map(|p| p.trim().parse::<usize>().context("grid/block components must be non-negative integers"))
        .collect::<Result<_>>()?;
    match parts.as_slice() {
        [x] => Ok(Dim3::one_d(*x)),
        [x, y] => Ok(Dim3::new(*x, *y, 1)),
        [x, y, z] => Ok(Dim3::new(*x, *y, *z)),
        _ => bail!("grid/block must have 1 to 3 comma-separated components"),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Info { backend, platform, device } => cmd_info(&backend, platform, device),
        Commands::Build { device_args, source, function } => cmd_build(&device_args, &source, &function),
        Commands::Run {
            device_args,
            source,
            function,
            grid,
            block,
            scalars,
            inputs,
            outputs,
            json,
        } => cmd_run(&device_args, &source, &function, &grid, &block, &scalars, &inputs, &outputs, json),
    }
}

fn cmd_info(backend: &BackendArg, platform: i32, device: i32) -> Result<()> {
    let backend = open_backend(backend, platform, device)?;
    println!("kind:        {:?}", backend.kind());
    println!("platform_id: {}", backend.platform_id());
    println!("device_id:   {}", backend.device_id());
    println!("simd_width:  {}", backend.simd_width()?);
    Ok(())
}

fn cmd_build(args: &DeviceArgs, source: &PathBuf, function: &str) -> Result<()> {
    let device = open_device(args)?;
    let kernel = device.build_kernel_from_source(source, function, &KernelInfo::new())?;
    println!("built {} (preferred_dim_size = {})", kernel.function_name(), kernel.preferred_dim_size()?);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_run(
    args: &DeviceArgs,
    source: &PathBuf,
    function: &str,
    grid: &str,
    block: &str,
    scalars: &[i32],
    inputs: &[PathBuf],
    outputs: &[String],
    json: bool,
) -> Result<()> {
    let device = open_device(args)?;
    let kernel = device.build_kernel_from_source(source, function, &KernelInfo::new())?;

    let mut launch_args: Vec<KernelArg> = scalars.iter().map(|s| KernelArg::from(*s)).collect();

    let mut in_buffers = Vec::new();
    for path in inputs {
        let bytes = std::fs::read(path).with_context(|| format!("reading input buffer {path:?}"))?;
        let mem = device.malloc(bytes.len(), Some(&bytes))?;
        launch_args.push(KernelArg::from(mem.clone()));
        in_buffers.push(mem);
    }

    let mut out_buffers = Vec::new();
    for spec in outputs {
        let (path, bytes) = spec
            .split_once(':')
            .ok_or_else(|| anyhow!("--out must be path:bytes, got {spec:?}"))?;
        let bytes: usize = bytes.parse().context("--out byte count must be an integer")?;
        let mem = device.malloc(bytes, None)?;
        launch_args.push(KernelArg::from(mem.clone()));
        out_buffers.push((PathBuf::from(path), mem));
    }

    kernel.launch(device.current_stream(), parse_dim3(grid)?, parse_dim3(block)?, &launch_args)?;
    device.finish()?;
    let elapsed = kernel.time_taken()?;

    for (path, mem) in &out_buffers {
        let mut buf = vec![0u8; mem.size()];
        mem.copy_to_host(&mut buf, 0, 0)?;
        std::fs::write(path, &buf).with_context(|| format!("writing output buffer {path:?}"))?;
    }

    if json {
        println!("{}", serde_json::json!({ "elapsed_seconds": elapsed }));
    } else {
        println!("launched {function} in {elapsed:.6}s");
    }

    for mem in in_buffers {
        mem.free()?;
    }
    for (_, mem) in out_buffers {
        mem.free()?;
    }
    kernel.free()?;
    device.free()?;

    Ok(())
}
