//! Subcommand implementations.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use candle_core::{DType, Device, Tensor};
use xtts_core::{
    distributed::{ChannelTransport, PipelineRole},
    engine::StageRunner,
    kv_cache::KVCacheManager,
    layers::AttentionMetadata,
    loader::{bind_weights, load_safetensors, parameter_specs, safetensor_paths},
    models::{start_token_indices, SamplingContext, TokenInputs, XttsGpt},
    multimodal::{process_prompt, Conditioning, ConditioningInputs},
    XttsGptConfig,
};

use crate::settings::CliSettings;

pub fn parse_dtype(name: &str) -> anyhow::Result<DType> {
    match name.to_lowercase().as_str() {
        "f32" | "float32" => Ok(DType::F32),
        "f16" | "float16" | "half" => Ok(DType::F16),
        "bf16" | "bfloat16" => Ok(DType::BF16),
        other => bail!("unsupported dtype '{other}' (expected f32, f16 or bf16)"),
    }
}

pub fn read_config(settings: &CliSettings) -> anyhow::Result<XttsGptConfig> {
    let path = settings
        .config
        .as_ref()
        .context("no decoder config given (--config or settings file)")?;
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let cfg = XttsGptConfig::from_json(&json)
        .with_context(|| format!("parsing {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validating {}", path.display()))?;
    Ok(cfg)
}

/// Expand directories to their checkpoint files; files are kept as given.
pub fn resolve_weight_paths(entries: &[PathBuf]) -> anyhow::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in entries {
        if entry.is_dir() {
            paths.extend(
                safetensor_paths(entry)
                    .with_context(|| format!("locating checkpoint in {}", entry.display()))?,
            );
        } else {
            paths.push(entry.clone());
        }
    }
    if paths.is_empty() {
        bail!("no weights given (--weights or settings file)");
    }
    Ok(paths)
}

fn read_weights(settings: &CliSettings, device: &Device) -> anyhow::Result<Vec<(String, Tensor)>> {
    let entries = settings.weights.as_deref().unwrap_or_default();
    let paths = resolve_weight_paths(entries)?;
    let weights = load_safetensors(&paths, device).context("reading safetensors")?;
    tracing::info!(files = paths.len(), tensors = weights.len(), "checkpoint read");
    Ok(weights)
}

fn roles(cfg: &XttsGptConfig, num_stages: usize) -> anyhow::Result<Vec<PipelineRole>> {
    (0..num_stages)
        .map(|s| {
            PipelineRole::for_stage(s, num_stages, cfg.num_hidden_layers)
                .with_context(|| format!("splitting into {num_stages} stages"))
        })
        .collect()
}

/// Validate the config and print its derived sizes and stage split.
pub fn inspect(settings: &CliSettings) -> anyhow::Result<()> {
    let cfg = read_config(settings)?;
    let head_dim = cfg.head_dim();
    println!("hidden_size          {}", cfg.hidden_size);
    println!("attention heads      {} x {}", cfg.num_attention_heads, head_dim);
    println!("layers               {}", cfg.num_hidden_layers);
    println!("mlp width            {}", cfg.n_inner());
    println!("activation           {}", cfg.activation_function);
    println!("audio vocabulary     {}", cfg.num_audio_tokens);
    match cfg.position_table_rows() {
        Some(rows) if cfg.relative_position_embeddings => {
            println!("position rows        {rows} (relative windows)")
        }
        Some(rows) => println!("position rows        {rows}"),
        None => println!("position rows        disabled"),
    }
    println!(
        "sentinels            filler={} start={}",
        cfg.pad_filler_token, cfg.start_audio_token
    );
    println!("logit scale          {}", cfg.logit_scale);
    println!("conditioning tokens  {}", cfg.conditioning_tokens);

    let dtype = parse_dtype(settings.dtype_or_default())?;
    let num_stages = settings.num_stages_or_default();
    for (stage, role) in roles(&cfg, num_stages)?.iter().enumerate() {
        let cache = xtts_core::kv_cache::CacheConfig::for_stage(&cfg, role, dtype, Device::Cpu);
        println!(
            "stage {stage}/{num_stages}          layers {:?} first={} last={} kv bytes/token={}",
            role.stage_layers,
            role.is_first,
            role.is_last,
            cache.bytes_per_token()
        );
    }
    Ok(())
}

/// Bind the checkpoint against one stage (or every stage) and report.
pub fn check_weights(settings: &CliSettings, stage_id: Option<usize>) -> anyhow::Result<()> {
    let cfg = read_config(settings)?;
    let weights = read_weights(settings, &Device::Cpu)?;
    let num_stages = settings.num_stages_or_default();
    let all_roles = roles(&cfg, num_stages)?;

    let selected: Vec<(usize, &PipelineRole)> = match stage_id {
        Some(id) => match all_roles.get(id) {
            Some(role) => vec![(id, role)],
            None => bail!("stage {id} does not exist in a {num_stages}-stage split"),
        },
        None => all_roles.iter().enumerate().collect(),
    };

    for (id, role) in selected {
        let specs = parameter_specs(&cfg, role);
        let bound = bind_weights(&specs, weights.iter().cloned())
            .with_context(|| format!("binding weights for stage {id}"))?;
        println!(
            "stage {id}: bound {} parameters, skipped {} checkpoint tensors",
            bound.len(),
            bound.skipped().len()
        );
        for name in bound.skipped() {
            tracing::debug!(stage = id, name = %name, "unused checkpoint tensor");
        }
    }
    Ok(())
}

/// Prime one request with zero conditioning, then decode greedily.
pub fn smoke(settings: &CliSettings) -> anyhow::Result<Vec<u32>> {
    let cfg = read_config(settings)?;
    let dtype = parse_dtype(settings.dtype_or_default())?;
    let device = Device::Cpu;
    let weights = read_weights(settings, &device)?;
    let num_stages = settings.num_stages_or_default();
    let cond_rows = settings.cond_rows_or_default();
    let steps = settings.steps_or_default();
    run_smoke(cfg, weights, dtype, &device, num_stages, cond_rows, steps)
}

/// The smoke loop, separated from file IO.
pub fn run_smoke(
    cfg: XttsGptConfig,
    weights: Vec<(String, Tensor)>,
    dtype: DType,
    device: &Device,
    num_stages: usize,
    cond_rows: usize,
    steps: usize,
) -> anyhow::Result<Vec<u32>> {
    let mut runners = Vec::with_capacity(num_stages);
    for (role, transport) in roles(&cfg, num_stages)?
        .into_iter()
        .zip(ChannelTransport::chain(num_stages, 1))
    {
        let model = XttsGpt::load(cfg.clone(), role, weights.iter().cloned(), dtype, device)
            .context("building decoder stage")?;
        let kv = KVCacheManager::new(&model.cache_config());
        runners.push(StageRunner::new(model, transport, kv));
    }

    let conditioning = ConditioningInputs::new(Conditioning::Single(Tensor::zeros(
        (cond_rows, cfg.hidden_size),
        DType::F32,
        device,
    )?));
    let prompt = process_prompt(&cfg, &conditioning, &[])?;
    let starts = start_token_indices(&conditioning.embeds)?;
    tracing::info!(prompt_len = prompt.len(), start_index = ?starts, "priming");

    let seq_len = prompt.len();
    let md = AttentionMetadata::prefill(vec![seq_len])?;
    let inputs = TokenInputs {
        token_ids: Tensor::new(prompt.as_slice(), device)?,
        position_ids: Tensor::arange(0u32, seq_len as u32, device)?,
        conditioning: Some(conditioning),
    };

    let mut tokens = Vec::with_capacity(steps + 1);
    let mut next = step_pipeline(&mut runners, inputs, &md)?;
    tokens.push(next);

    for step in 0..steps {
        let seq_len = seq_len + step + 1;
        let md = AttentionMetadata::decode(vec![seq_len])?;
        // Audio positions restart after the conditioning prefix.
        let inputs = TokenInputs {
            token_ids: Tensor::new(&[next], device)?,
            position_ids: Tensor::new(&[(step + 1) as u32], device)?,
            conditioning: None,
        };
        next = step_pipeline(&mut runners, inputs, &md)?;
        tokens.push(next);
    }

    for runner in &mut runners {
        runner.free_slot(0);
    }
    tracing::info!(?tokens, "smoke run finished");
    Ok(tokens)
}

/// Push one call through every stage in order and pick the argmax token.
fn step_pipeline(
    runners: &mut [StageRunner<XttsGpt, ChannelTransport>],
    inputs: TokenInputs,
    md: &AttentionMetadata,
) -> anyhow::Result<u32> {
    let mut inputs = Some(inputs);
    let mut hidden = None;
    for runner in runners.iter_mut() {
        hidden = runner.step(inputs.take(), md)?;
    }
    let (Some(hidden), Some(last)) = (hidden, runners.last()) else {
        bail!("last pipeline stage produced no hidden states");
    };
    tracing::debug!(shape = ?hidden.dims(), "final hidden states");

    let logits = last
        .model()
        .compute_logits(&hidden, &SamplingContext::last_token_rows(md))?;
    let token = logits
        .flatten_all()?
        .to_dtype(DType::F32)?
        .argmax(0)?
        .to_scalar::<u32>()?;
    Ok(token)
}

/// Merge the given values into the settings file, keeping what it already
/// holds, and return the file written.
pub fn save_settings(given: &CliSettings, path: Option<&Path>) -> anyhow::Result<PathBuf> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => CliSettings::default_path().context("no config directory available")?,
    };
    let mut settings = if path.exists() {
        CliSettings::load_from(&path).with_context(|| format!("reading {}", path.display()))?
    } else {
        CliSettings::default()
    };
    settings.merge(given);
    settings
        .save_to(&path)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use xtts_core::testing::{full_weight_set, tiny_config};

    #[test]
    fn dtype_names() {
        assert_eq!(parse_dtype("F32").unwrap(), DType::F32);
        assert_eq!(parse_dtype("bf16").unwrap(), DType::BF16);
        assert_eq!(parse_dtype("half").unwrap(), DType::F16);
        assert!(parse_dtype("int8").is_err());
    }

    #[test]
    fn smoke_runs_the_same_on_one_or_two_stages() {
        let cfg = tiny_config();
        let weights = full_weight_set(&cfg, &PipelineRole::single(2), 5);

        let one = run_smoke(cfg.clone(), weights.clone(), DType::F32, &Device::Cpu, 1, 4, 3).unwrap();
        let two = run_smoke(cfg, weights, DType::F32, &Device::Cpu, 2, 4, 3).unwrap();
        assert_eq!(one.len(), 4);
        assert!(one.iter().all(|&t| (t as usize) < 1026));
        assert_eq!(one, two);
    }

    #[test]
    fn config_file_is_read_and_validated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"hidden_size": 16, "num_attention_heads": 4, "num_hidden_layers": 2,
                "num_audio_tokens": 1026, "max_audio_tokens": 61}"#,
        )
        .unwrap();
        let settings = CliSettings {
            config: Some(path.clone()),
            ..Default::default()
        };
        assert_eq!(read_config(&settings).unwrap().n_inner(), 64);

        std::fs::write(
            &path,
            r#"{"hidden_size": 16, "num_attention_heads": 5, "num_hidden_layers": 2,
                "num_audio_tokens": 1026, "max_audio_tokens": 61}"#,
        )
        .unwrap();
        assert!(read_config(&settings).is_err());
    }

    #[test]
    fn saving_settings_keeps_earlier_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xtts").join("config.toml");

        let first = CliSettings {
            steps: Some(4),
            dtype: Some("bf16".into()),
            ..Default::default()
        };
        assert_eq!(save_settings(&first, Some(&path)).unwrap(), path);

        let second = CliSettings {
            cond_rows: Some(2),
            dtype: Some("f16".into()),
            ..Default::default()
        };
        save_settings(&second, Some(&path)).unwrap();

        let saved = CliSettings::load_from(&path).unwrap();
        assert_eq!(saved.steps, Some(4));
        assert_eq!(saved.cond_rows, Some(2));
        assert_eq!(saved.dtype.as_deref(), Some("f16"));
    }

    #[test]
    fn saving_settings_refuses_to_clobber_a_broken_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "steps = \"many\"").unwrap();

        let given = CliSettings {
            steps: Some(1),
            ..Default::default()
        };
        assert!(save_settings(&given, Some(&path)).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "steps = \"many\"");
    }

    #[test]
    fn weight_directories_are_expanded() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("model.safetensors");
        let cfg = tiny_config();
        let weights: std::collections::HashMap<_, _> =
            full_weight_set(&cfg, &PipelineRole::single(2), 0).into_iter().collect();
        candle_core::safetensors::save(&weights, &file).unwrap();

        let paths = resolve_weight_paths(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(paths, vec![file]);
        assert!(resolve_weight_paths(&[]).is_err());
    }
}
