use alpaca_base::{Generator, InferenceWorker, Model, StopReason, Trigger};
use clap::Parser;
use cli_args::Args;
use color_eyre::eyre::{self, WrapErr};

mod cli_args;
mod discord;
mod reply;
mod util;

fn main() -> eyre::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    color_eyre::install()?;

    let args = Args::parse();
    match args {
        Args::Serve(args) => serve(&args),
        Args::Infer(args) => infer(&args),
        Args::PromptTokens(args) => prompt_tokens(&args),
    }
}

fn serve(args: &cli_args::Serve) -> eyre::Result<()> {
    let template = args.prompt_file.template()?;
    let trigger = Trigger::new(args.trigger.as_str());
    let model = args.model_load.load()?;

    let generator = Generator::new(
        model,
        args.generate.inference_session_config(args.model_load.num_ctx_tokens),
        args.generate.inference_parameters(),
    );
    log_settings(&generator);
    let worker = InferenceWorker::spawn(generator, args.queue_capacity)
        .wrap_err("Could not start the inference thread")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("Could not start the async runtime")?;
    runtime.block_on(discord::run(
        args.token.expose(),
        discord::Handler::new(trigger, template, worker),
    ))
}

fn infer(args: &cli_args::Infer) -> eyre::Result<()> {
    let prompt = if args.raw {
        args.prompt.clone()
    } else {
        args.prompt_file.template()?.render(&args.prompt)
    };
    let model = args.model_load.load()?;
    let generator = Generator::new(
        model,
        args.generate.inference_session_config(args.model_load.num_ctx_tokens),
        args.generate.inference_parameters(),
    );

    log_settings(&generator);

    let completion = generator.generate(&prompt, util::print_token)?;
    println!();

    match completion.stop_reason {
        StopReason::EndOfText => {}
        StopReason::MaximumTokens => log::info!(
            "Stopped after the maximum of {} tokens",
            completion.stats.predict_tokens
        ),
        StopReason::Interrupted(err) => log::error!("Generation was interrupted: {err}"),
    }

    if args.stats {
        println!();
        println!("{}", completion.stats);
        if let Some(tokens_per_second) = completion.stats.tokens_per_second() {
            println!("tokens_per_second: {tokens_per_second:.2}");
        }
        println!();
    }

    Ok(())
}

fn log_settings<M: Model>(generator: &Generator<M>) {
    let config = generator.session_config();
    let parameters = generator.parameters();
    log::info!(
        "Context of {} tokens on {} threads; up to {} predicted tokens with {:?} (seed {})",
        config.context_size,
        config.n_threads,
        parameters.maximum_token_count,
        parameters.sampler,
        parameters.seed
    );
}

fn prompt_tokens(args: &cli_args::PromptTokens) -> eyre::Result<()> {
    let prompt = if args.raw {
        args.prompt.clone()
    } else {
        args.prompt_file.template()?.render(&args.prompt)
    };
    let model = args.model_load.load()?;
    let tokens = model
        .tokenize(&prompt, true)
        .wrap_err("Could not tokenize prompt")?;

    log::info!("=== Dumping prompt tokens:");
    log::info!(
        "{}",
        tokens
            .iter()
            .map(|tid| tid.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    let pieces = tokens
        .iter()
        .map(|&tid| {
            let bytes = model.token_to_bytes(tid)?;
            Ok(format!("{:?}:{tid}", String::from_utf8_lossy(&bytes)))
        })
        .collect::<eyre::Result<Vec<_>>>()?;
    log::info!("{}", pieces.join(", "));

    Ok(())
}
