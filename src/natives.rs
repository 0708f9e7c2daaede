use super::object::NativeFn;
use super::value::Value;
use super::vm::Vm;
use rand::Rng;

pub const NATIVES: [(&str, u8, NativeFn); 2] = [("clock", 0, clock), ("random", 0, random)];

/// Monotonic seconds since the VM was created.
pub fn clock(vm: &Vm, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(vm.started_at().elapsed().as_secs_f64()))
}

pub fn random(_vm: &Vm, _args: &[Value]) -> Result<Value, String> {
    let mut rng = rand::thread_rng();
    Ok(Value::Number(rng.gen_range(0.0..1.0)))
}
