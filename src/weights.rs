use crate::common::*;

/// Prefix prepended to parameter names by distributed-training wrappers.
const PARALLEL_PREFIX: &str = "module.";

/// Loads a serialized parameter mapping into the variable store.
///
/// `strip_parallel_prefix` removes the distributed-training name prefix from
/// every key before matching. Missing checkpoint files are fatal; the model
/// cannot run untrained.
pub fn load_params(
    vs: &mut nn::VarStore,
    path: impl AsRef<Path>,
    strip_parallel_prefix: bool,
) -> Result<()> {
    let path = path.as_ref();
    ensure!(
        path.exists(),
        "weights file not found at {}, train a model or point to an existing checkpoint",
        path.display()
    );

    if strip_parallel_prefix {
        let named_tensors = Tensor::load_multi(path)
            .with_context(|| format!("failed to read checkpoint {}", path.display()))?;
        let variables = vs.variables();

        tch::no_grad(|| -> Result<_> {
            for (name, tensor) in &named_tensors {
                let name = name.strip_prefix(PARALLEL_PREFIX).unwrap_or(name);
                let variable = variables.get(name).ok_or_else(|| {
                    format_err!(
                        "checkpoint {} contains unknown parameter {}",
                        path.display(),
                        name
                    )
                })?;
                ensure!(
                    variable.size() == tensor.size(),
                    "parameter {} has shape {:?} in checkpoint, expected {:?}",
                    name,
                    tensor.size(),
                    variable.size()
                );
                let mut variable = variable.shallow_clone();
                variable.copy_(tensor);
            }
            Ok(())
        })?;
    } else {
        vs.load(path)
            .with_context(|| format!("failed to load checkpoint {}", path.display()))?;
    }

    info!("loaded weights from {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_checkpoint_names_the_path() {
        let mut vs = nn::VarStore::new(Device::Cpu);
        let error = load_params(&mut vs, "/no/such/checkpoint.ot", false).unwrap_err();
        assert!(error.to_string().contains("/no/such/checkpoint.ot"));
    }

    #[test]
    fn round_trips_through_a_saved_store() -> Result<()> {
        let dir = std::env::temp_dir().join("flowgen-weights-test");
        fs::create_dir_all(&dir)?;
        let file = dir.join("params.ot");

        let vs = nn::VarStore::new(Device::Cpu);
        let weight = vs.root().var("weight", &[4, 3], nn::Init::KaimingUniform);
        vs.save(&file)?;

        let mut other = nn::VarStore::new(Device::Cpu);
        let other_weight = other.root().var("weight", &[4, 3], nn::Init::Const(0.0));
        load_params(&mut other, &file, false)?;

        ensure!(
            other_weight.allclose(&weight, 1e-6, 1e-8, false),
            "weights were not restored"
        );
        fs::remove_file(&file).ok();
        Ok(())
    }
}
