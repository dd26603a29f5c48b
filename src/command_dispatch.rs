//! Purpose: Hold top-level CLI command dispatch for `cafhost`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Every command that loads something gives it back before returning, unless
//! the module reports it is busy.

use super::*;

pub(super) fn dispatch_command(
    command: Command,
    config: Option<PathBuf>,
) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "cafhost", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::List => {
            let host = build_host(config)?;
            emit_json(json!({ "subsystems": registered_json(&host) }));
            Ok(RunOutcome::ok())
        }
        Command::Resolve { identifier } => {
            let host = build_host(config)?;
            if !host.registry().is_registered(&identifier) {
                return Err(Error::new(ErrorKind::NotRegistered)
                    .with_message("subsystem is not registered")
                    .with_identifier(identifier));
            }
            let path = host.registry().module_path(&identifier)?;
            emit_json(json!({
                "identifier": identifier,
                "path": path.display().to_string(),
            }));
            Ok(RunOutcome::ok())
        }
        Command::Load { identifier, unload } => {
            let host = build_host(config)?;
            let mut subsystem = if unload {
                SubsystemHandle::unloadable(&host)
            } else {
                SubsystemHandle::new(&host)
            };
            subsystem.load(&identifier)?;
            let module = handle_json(&host, &subsystem);
            let unloaded = if unload {
                subsystem.unload(false)?
            } else {
                false
            };
            emit_json(json!({
                "identifier": identifier,
                "module": module,
                "unloaded": unloaded,
            }));
            Ok(RunOutcome::ok())
        }
        Command::Create {
            identifier,
            object,
            iid,
        } => {
            let host = build_host(config)?;
            let iid = parse_iid(iid.as_deref())?;
            let object_id = object.unwrap_or_else(|| identifier.clone());

            let mut subsystem = SubsystemHandle::unloadable(&host);
            subsystem.load(&identifier)?;
            let module = handle_json(&host, &subsystem);
            let raw = subsystem.create_instance(&object_id, &iid)?;
            // Whatever interface was requested, keep it only as the base identity.
            let instance = unsafe { SmartRef::<CafObject>::from_object(raw.as_ptr()) };
            unsafe { cafbase::abi::release(raw) };
            let created = created_json(&instance, &object_id, &iid);
            drop(instance);
            let unloaded = subsystem.unload(false)?;

            emit_json(json!({
                "identifier": identifier,
                "module": module,
                "instance": created,
                "unloaded": unloaded,
            }));
            Ok(RunOutcome::ok())
        }
        Command::Which { symbol, library } => {
            let host = build_host(config)?;
            let loader = host.loader();
            let handle = match library.as_deref() {
                Some(name) => Some(loader.load(name, false)?),
                None => None,
            };
            let resolved = loader
                .function_address(handle, &symbol)
                .and_then(|address| {
                    loader
                        .library_name_from_address(address)
                        .map(|path| (address, path))
                });
            if let Some(handle) = handle {
                loader.unload(handle, false)?;
            }
            let (address, path) = resolved?;
            emit_json(json!({
                "symbol": symbol,
                "address": format!("{:#x}", address as usize),
                "library": path.display().to_string(),
            }));
            Ok(RunOutcome::ok())
        }
    }
}
