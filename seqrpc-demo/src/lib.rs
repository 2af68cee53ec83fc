use serde::{Deserialize, Serialize};
use seqrpc::{Result, Service};
use std::time::Duration;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SumArgs {
    pub num1: i64,
    pub num2: i64,
}

/// The demo service: an adder plus a deliberately slow method for trying
/// out the timeout knobs.
///
/// # Errors
pub fn arith_service() -> Result<Service> {
    let mut service = Service::new("Arith")?;
    service
        .register_method("Sum", |args: SumArgs| async move {
            Ok(args.num1 + args.num2)
        })?
        .register_method("SlowSum", |args: SumArgs| async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(args.num1 + args.num2)
        })?;
    Ok(service)
}
