use super::Pipeline;
use crate::GlobalArgs;
use cdflow_core::{parse_release_data, ReleaseArgs};

pub fn run(
    globals: &GlobalArgs,
    version: String,
    release_data: &[String],
    terraform_log_level: Option<String>,
) -> Result<u8, String> {
    let release_data = release_data
        .iter()
        .map(|value| parse_release_data(value))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| e.to_string())?;
    let args = ReleaseArgs {
        version,
        release_data,
        terraform_log_level,
    };

    let mut pipeline = Pipeline::open(globals)?;
    let result = pipeline.engine().release(&args);
    pipeline.finish("release", "", &args.version, result)
}
