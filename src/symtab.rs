use std::sync::Mutex;

/// `[start, end)` of one symbol's instructions.
pub type AddressRange = (u64, u64);

/// The symbol/loader collaborator. The runtime queries it once at init
/// to turn spec strings into address ranges and, when requested, to
/// redirect PLT/GOT slots. The default implementation resolves nothing,
/// which leaves hex-literal specs as the only way to address code.
pub trait SymbolService: Send {
    fn load_symtabs(&mut self, _exe: &str, _demangle: bool) {}

    fn resolve(&self, _name: &str, _section: Option<&str>) -> Vec<AddressRange> {
        Vec::new()
    }

    fn hook_pltgot(&mut self, _exe: &str) -> Result<(), ()> {
        Err(())
    }
}

pub struct NullSymbolService;

impl SymbolService for NullSymbolService {}

lazy_static! {
    static ref SERVICE: Mutex<Box<dyn SymbolService>> = Mutex::new(Box::new(NullSymbolService));
}

/// Replace the collaborator. Must happen before library init reads the
/// spec strings; later calls only affect a future re-init.
pub fn install_service(service: Box<dyn SymbolService>) {
    *SERVICE.lock().unwrap() = service;
}

pub fn with_service<R>(f: impl FnOnce(&mut dyn SymbolService) -> R) -> R {
    let mut guard = SERVICE.lock().unwrap();
    f(guard.as_mut())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_service_resolves_nothing() {
        let service = NullSymbolService;
        assert!(service.resolve("main", None).is_empty());
        assert!(service.resolve("main", Some("PLT")).is_empty());
    }
}
