#![forbid(unsafe_code)]

#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
fn main() -> anyhow::Result<()> {
    native::main()
}

#[cfg(not(target_arch = "wasm32"))]
mod native {
    use std::fs::File;
    use std::io::{BufReader, BufWriter};
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use anyhow::{bail, Context, Result};
    use cinder_dbt::config::MAX_OPT_LEVEL;
    use cinder_dbt::{
        BranchProfile, BranchTargetProfile, ControllerKind, ExecConfig, GuestAddr, ProcessState, RegId,
        TranslatorConfig,
    };
    use cinder_refisa::isa::GPR_COUNT;
    use cinder_refisa::{RefInterpreter, RefIsa, RefMachine};
    use clap::Parser;
    use serde::Deserialize;
    use tracing::info;
    use tracing_subscriber::EnvFilter;

    #[derive(Debug, Parser)]
    #[command(about = "Run a reference-ISA image under the cinder trace translator")]
    pub struct Args {
        /// Raw program image, loaded at address 0.
        pub image: PathBuf,

        /// Initial program counter.
        #[arg(long, default_value = "0", value_parser = parse_addr)]
        pub entry: GuestAddr,

        /// Guest memory size in bytes.
        #[arg(long, default_value = "0x10000", value_parser = parse_size)]
        pub mem_size: usize,

        /// Execution policy.
        #[arg(long, default_value_t = ControllerKind::Staged)]
        pub controller: ControllerKind,

        /// Translator optimisation level (overrides the config file).
        #[arg(long)]
        pub opt_level: Option<u8>,

        /// Instructions a block must accumulate before it is compiled (overrides the config file).
        #[arg(long)]
        pub hot_threshold: Option<u64>,

        /// Translate one guest instruction per trace.
        #[arg(long)]
        pub single_instruction: bool,

        /// Spill every filled register when a trace finishes.
        #[arg(long)]
        pub always_spill: bool,

        /// Stop after this many controller steps.
        #[arg(long)]
        pub max_steps: Option<u64>,

        /// JSON file with `translator` and `exec` sections.
        #[arg(long)]
        pub config: Option<PathBuf>,

        /// Seed the branch profile from a previous run.
        #[arg(long)]
        pub profile_in: Option<PathBuf>,

        /// Write the branch profile here on exit.
        #[arg(long)]
        pub profile_out: Option<PathBuf>,

        /// Log filter, e.g. `cinder_dbt=debug`. Defaults to `RUST_LOG`, then `warn`.
        #[arg(long)]
        pub log: Option<String>,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(default)]
    struct FileConfig {
        translator: TranslatorConfig,
        exec: ExecConfig,
    }

    fn parse_addr(s: &str) -> Result<u64, String> {
        let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
            None => s.replace('_', "").parse(),
        };
        parsed.map_err(|e| format!("invalid number `{s}`: {e}"))
    }

    fn parse_size(s: &str) -> Result<usize, String> {
        let v = parse_addr(s)?;
        usize::try_from(v).map_err(|_| format!("`{s}` does not fit in usize"))
    }

    fn init_logging(filter: Option<&str>) -> Result<()> {
        let filter = match filter {
            Some(f) => EnvFilter::try_new(f).with_context(|| format!("invalid log filter `{f}`"))?,
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        };
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        Ok(())
    }

    fn load_config(path: Option<&Path>) -> Result<FileConfig> {
        let Some(path) = path else {
            return Ok(FileConfig::default());
        };
        let f = File::open(path)
            .with_context(|| format!("failed to open config file: {}", path.display()))?;
        serde_json::from_reader(BufReader::new(f))
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    fn load_profile(path: Option<&Path>) -> Result<BranchProfile> {
        let Some(path) = path else {
            return Ok(BranchProfile::new());
        };
        let f = File::open(path)
            .with_context(|| format!("failed to open profile: {}", path.display()))?;
        BranchProfile::load(BufReader::new(f))
            .with_context(|| format!("failed to parse profile: {}", path.display()))
    }

    fn load_machine(image: &[u8], mem_size: usize, entry: GuestAddr) -> Result<RefMachine> {
        let mut machine =
            RefMachine::with_image(mem_size, 0, image).context("failed to load image")?;
        machine.set_pc(entry);
        Ok(machine)
    }

    pub fn main() -> Result<()> {
        let args = Args::parse();
        init_logging(args.log.as_deref())?;

        let FileConfig {
            translator: mut tcfg,
            exec: mut ecfg,
        } = load_config(args.config.as_deref())?;
        if let Some(level) = args.opt_level {
            if level > MAX_OPT_LEVEL {
                bail!("--opt-level {level} exceeds the maximum of {MAX_OPT_LEVEL}");
            }
            tcfg.opt_level = level;
        }
        if let Some(threshold) = args.hot_threshold {
            ecfg.hot_threshold = threshold;
        }
        tcfg.single_instruction |= args.single_instruction;
        tcfg.always_spill |= args.always_spill;

        let image = std::fs::read(&args.image)
            .with_context(|| format!("failed to read image: {}", args.image.display()))?;
        let mut machine = load_machine(&image, args.mem_size, args.entry)?;

        let profile = Arc::new(load_profile(args.profile_in.as_deref())?);
        let shared: Arc<dyn BranchTargetProfile> = profile.clone();
        let translator = cinder_refisa::translator(Arc::new(RefIsa::new()), shared, tcfg);
        let cache = Arc::clone(translator.cache());

        info!(
            image = %args.image.display(),
            controller = %args.controller,
            entry = args.entry,
            "starting"
        );
        let mut controller =
            cinder_dbt::exec::new_controller(args.controller, RefInterpreter, translator, &ecfg);
        let result = controller.run(&mut machine, args.max_steps);

        // The profile is worth keeping even when the guest faulted.
        if let Some(path) = &args.profile_out {
            let f = File::create(path)
                .with_context(|| format!("failed to create profile: {}", path.display()))?;
            profile
                .save(BufWriter::new(f))
                .with_context(|| format!("failed to write profile: {}", path.display()))?;
        }

        let summary = result.with_context(|| format!("execution stopped at {:#x}", machine.pc()))?;
        let stats = controller.stats();

        println!("controller:    {}", args.controller);
        println!("pc:            {:#x}", summary.final_pc);
        println!("steps:         {}", summary.steps);
        println!("interpreted:   {}", summary.interpreted_instructions);
        println!("compiled:      {}", summary.compiled_instructions);
        println!("promotions:    {}", stats.promotions);
        println!("traces:        {}", cache.len());
        for i in 0..GPR_COUNT {
            println!("r{i}:            {:#010x}", machine.reg(RegId(u16::from(i))));
        }
        if !machine.output().is_empty() {
            println!("output:        {:?}", machine.output());
        }
        match machine.exit_status() {
            Some(status) => println!("exit status:   {status}"),
            None if summary.finished => {}
            None => println!("step limit reached"),
        }
        Ok(())
    }

}
