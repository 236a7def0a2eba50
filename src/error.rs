#[derive(thiserror::Error, Debug)]
pub enum CascadeError {
    #[error("snapshot for entity {entity_id} is missing required field '{field}'")]
    MalformedSnapshot {
        entity_id: String,
        field: &'static str,
    },
    #[error("no snapshot found at {bucket}/{path} version {version}")]
    MissingSnapshot {
        bucket: String,
        path: String,
        version: u64,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum AllocationError {
    #[error("no line with a usable weight basis to absorb the remainder of charge '{charge_code}'")]
    NoEligibleLines { charge_code: String },
    #[error("weight basis total is zero, proportional shares are undefined")]
    ZeroBasis,
}
