//! # Directory loader and reloader.
//!
//! Services are loaded by name from the configured service directories,
//! searched in order; the file name is the service name. Loading recurses
//! into dependencies; a name already being loaded means the dependency
//! chain has looped back, which is reported as a cycle.
//!
//! ## Reload rules
//! - STOPPED: full replacement is permitted, including a variant change
//!   (the pooled entry is replaced in place so dependent edges stay valid).
//! - STARTED: in-place update only. Variant, console flags, log type, and
//!   pid-file changes are refused; a newly added regular dependency must
//!   already be STARTED.
//! - STARTING / STOPPING: refused.
//!
//! A reload that would introduce a dependency cycle is rejected before any
//! edge is modified.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::config::parser::{parse, ServiceDescription};
use crate::error::LoadError;
use crate::service::dep::DependencyType;
use crate::service::set::{ServiceId, ServiceSet};
use crate::service::types::{ServiceState, ServiceType};
use crate::service::{
    BgProcessPayload, ProcessConfig, ProcessPayload, ScriptedPayload, ServiceKind,
};

impl ServiceSet {
    /// Loads a service (and its dependencies) by name, or returns the
    /// already-loaded service.
    pub fn load_service(&mut self, name: &str) -> Result<ServiceId, LoadError> {
        if let Some(id) = self.find_service(name, false) {
            return Ok(id);
        }
        self.load_service_impl(name)
    }

    fn load_service_impl(&mut self, name: &str) -> Result<ServiceId, LoadError> {
        if self.loading.contains(name) {
            return Err(LoadError::Cycle {
                name: name.to_string(),
            });
        }
        self.loading.insert(name.to_string());
        let result = self.load_service_inner(name);
        self.loading.remove(name);
        result
    }

    fn load_service_inner(&mut self, name: &str) -> Result<ServiceId, LoadError> {
        let (desc, file_path) = self.find_and_parse(name)?;

        let kind = create_kind(&desc)?;
        let id = self.add_service(name, kind);

        if let Err(e) = self.load_dependencies(id, &desc, &file_path) {
            self.unregister(id);
            return Err(e);
        }

        self.apply_to_record(id, &desc);
        Ok(id)
    }

    /// Searches the service directories for a description file.
    fn find_and_parse(&self, name: &str) -> Result<(ServiceDescription, PathBuf), LoadError> {
        for dir in &self.service_dirs {
            let path = dir.join(name);
            match std::fs::read_to_string(&path) {
                Ok(content) => {
                    let desc = parse(&content, name, &path)?;
                    return Ok((desc, path));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(LoadError::Io {
                        name: name.to_string(),
                        path,
                        source: e,
                    })
                }
            }
        }
        Err(LoadError::NotFound {
            name: name.to_string(),
        })
    }

    fn load_dependencies(
        &mut self,
        id: ServiceId,
        desc: &ServiceDescription,
        file_path: &Path,
    ) -> Result<(), LoadError> {
        let resolved = self.resolve_dependencies(desc, file_path)?;
        self.apply_dependencies(id, resolved);
        Ok(())
    }

    /// Wires resolved edges. A `before` declaration is stored on the other
    /// service: "we start before X" means X waits for us, so the ordering
    /// edge runs from X to us.
    fn apply_dependencies(&mut self, id: ServiceId, resolved: Vec<(ServiceId, DependencyType)>) {
        for (dep_id, dep_type) in resolved {
            if dep_type == DependencyType::Before {
                self.add_dep(dep_id, id, dep_type);
            } else {
                self.add_dep(id, dep_id, dep_type);
            }
        }
    }

    /// Removes every edge owned by this service's description: outgoing
    /// edges of all kinds except BEFORE (those belong to other services'
    /// declarations), plus incoming BEFORE edges (ours).
    fn remove_owned_edges(&mut self, id: ServiceId) {
        for eid in self.rec(id).depends_on.clone() {
            if self.edge(eid).dep_type != DependencyType::Before {
                self.rm_dep_edge(eid);
            }
        }
        for eid in self.rec(id).dependents.clone() {
            if self.edge(eid).dep_type == DependencyType::Before {
                self.rm_dep_edge(eid);
            }
        }
    }

    /// Loads every named dependency, returning the resolved edge list
    /// without modifying this service.
    fn resolve_dependencies(
        &mut self,
        desc: &ServiceDescription,
        file_path: &Path,
    ) -> Result<Vec<(ServiceId, DependencyType)>, LoadError> {
        let mut resolved = Vec::new();

        let lists: [(&[String], DependencyType); 5] = [
            (&desc.depends_on, DependencyType::Regular),
            (&desc.depends_ms, DependencyType::Milestone),
            (&desc.waits_for, DependencyType::WaitsFor),
            (&desc.before, DependencyType::Before),
            (&desc.after, DependencyType::After),
        ];
        for (names, dep_type) in lists {
            for dep_name in names {
                let dep_id = self.load_service(dep_name)?;
                resolved.push((dep_id, dep_type));
            }
        }

        let dir_lists: [(&[String], DependencyType); 3] = [
            (&desc.depends_on_d, DependencyType::Regular),
            (&desc.depends_ms_d, DependencyType::Milestone),
            (&desc.waits_for_d, DependencyType::WaitsFor),
        ];
        for (dirs, dep_type) in dir_lists {
            for dir in dirs {
                let dep_dir = if Path::new(dir).is_absolute() {
                    PathBuf::from(dir)
                } else {
                    file_path.parent().unwrap_or(Path::new(".")).join(dir)
                };
                for dep_name in read_dep_dir(&desc.name, &dep_dir)? {
                    let dep_id = self.load_service(&dep_name)?;
                    resolved.push((dep_id, dep_type));
                }
            }
        }

        Ok(resolved)
    }

    /// Applies parsed settings common to all variants.
    fn apply_to_record(&mut self, id: ServiceId, desc: &ServiceDescription) {
        let rec = self.rec_mut(id);
        rec.description = desc.description.clone();
        rec.auto_restart = desc.auto_restart;
        rec.smooth_recovery = desc.smooth_recovery;
        rec.flags = desc.flags;
        rec.term_signal = desc.term_signal;
        // A description without a chain-to line keeps the existing target.
        if desc.chain_to.is_some() {
            rec.chain_to = desc.chain_to.clone();
        }
    }

    // ---- Reload ----

    /// Re-parses the description file of a loaded service and applies it.
    pub fn reload_service(&mut self, id: ServiceId) -> Result<(), LoadError> {
        let name = self.rec(id).name.clone();
        let (desc, file_path) = self.find_and_parse(&name)?;

        match self.rec(id).state {
            ServiceState::Stopped => self.reload_stopped(id, &desc, &file_path),
            ServiceState::Started => self.reload_started(id, &desc, &file_path),
            state => Err(LoadError::ReloadRejected {
                name,
                message: format!("cannot reload service in state {state}"),
            }),
        }
    }

    /// Stopped service: anything may change, including the variant.
    fn reload_stopped(
        &mut self,
        id: ServiceId,
        desc: &ServiceDescription,
        file_path: &Path,
    ) -> Result<(), LoadError> {
        self.check_cycle(id, desc)?;

        if desc.service_type != self.service_type(id) {
            let name = self.rec(id).name.clone();
            let new_kind = create_kind(desc)?;

            self.loading.insert(name.clone());
            let resolved = self.resolve_dependencies(desc, file_path);
            self.loading.remove(&name);
            let resolved = resolved?;

            // Replace the pooled entry in place: the id stays valid, so
            // dependent edges transfer for free. Our own old edges go.
            self.cleanup_monitor(id);
            self.remove_owned_edges(id);
            self.svc_mut(id).kind = new_kind;
            self.apply_dependencies(id, resolved);
            self.apply_to_record(id, desc);
            return Ok(());
        }

        self.update_in_place(id, desc, file_path)
    }

    /// Started service: restricted in-place update.
    fn reload_started(
        &mut self,
        id: ServiceId,
        desc: &ServiceDescription,
        file_path: &Path,
    ) -> Result<(), LoadError> {
        let name = self.rec(id).name.clone();
        let reject = |message: String| {
            Err(LoadError::ReloadRejected {
                name: name.clone(),
                message,
            })
        };

        if desc.service_type != self.service_type(id) {
            return reject("cannot change type of running service".to_string());
        }

        let flags = self.rec(id).flags;
        if flags.starts_on_console != desc.flags.starts_on_console
            || flags.shares_console != desc.flags.shares_console
        {
            return reject("cannot change console flags for running service".to_string());
        }

        if self.log_type_of(id) != desc.log_type
            && matches!(
                self.service_type(id),
                ServiceType::Process | ServiceType::BgProcess
            )
        {
            return reject("cannot change log-type for running service".to_string());
        }

        if let ServiceKind::BgProcess(p) = &self.svc(id).kind {
            let new_pid_file = desc.pid_file.clone().unwrap_or_default();
            if p.pid_file != new_pid_file {
                return reject("cannot change pid-file for running service".to_string());
            }
        }

        // New regular dependencies must already be running.
        let current_regular: HashSet<String> = self
            .rec(id)
            .depends_on
            .iter()
            .filter(|&&eid| self.edge(eid).dep_type == DependencyType::Regular)
            .map(|&eid| self.rec(self.edge(eid).to).name.clone())
            .collect();
        for dep_name in &desc.depends_on {
            if current_regular.contains(dep_name) {
                continue;
            }
            let started = self
                .find_service(dep_name, false)
                .map(|dep| self.rec(dep).state == ServiceState::Started)
                .unwrap_or(false);
            if !started {
                return reject(format!(
                    "cannot add non-started dependency '{dep_name}' to running service"
                ));
            }
        }

        self.update_in_place(id, desc, file_path)
    }

    fn update_in_place(
        &mut self,
        id: ServiceId,
        desc: &ServiceDescription,
        file_path: &Path,
    ) -> Result<(), LoadError> {
        self.check_cycle(id, desc)?;

        // Resolve the new dependency set before touching existing edges;
        // a load failure leaves the graph unchanged.
        let name = self.rec(id).name.clone();
        self.loading.insert(name.clone());
        let resolved = self.resolve_dependencies(desc, file_path);
        self.loading.remove(&name);
        let resolved = resolved?;

        update_type_specific(&mut self.svc_mut(id).kind, desc)?;

        self.remove_owned_edges(id);
        self.apply_dependencies(id, resolved);

        self.apply_to_record(id, desc);
        Ok(())
    }

    /// Rejects a reload whose new dependencies reach back to the service.
    fn check_cycle(&self, id: ServiceId, desc: &ServiceDescription) -> Result<(), LoadError> {
        let own_name = &self.rec(id).name;

        let mut queue: Vec<String> = Vec::new();
        queue.extend(desc.depends_on.iter().cloned());
        queue.extend(desc.depends_ms.iter().cloned());
        queue.extend(desc.waits_for.iter().cloned());
        queue.extend(desc.after.iter().cloned());

        let mut visited: HashSet<String> = HashSet::new();
        while let Some(dep_name) = queue.pop() {
            if dep_name == *own_name {
                return Err(LoadError::ReloadRejected {
                    name: own_name.clone(),
                    message: "cyclic dependency detected during reload".to_string(),
                });
            }
            if !visited.insert(dep_name.clone()) {
                continue;
            }
            if let Some(dep_id) = self.find_service(&dep_name, false) {
                for &eid in &self.rec(dep_id).depends_on {
                    queue.push(self.rec(self.edge(eid).to).name.clone());
                }
            }
        }
        Ok(())
    }
}

/// Lists the dependency names in a `.d` directory: each non-hidden regular
/// entry is one dependency. A missing directory is not an error.
fn read_dep_dir(svc_name: &str, dir: &Path) -> Result<Vec<String>, LoadError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(LoadError::Io {
                name: svc_name.to_string(),
                path: dir.to_path_buf(),
                source: e,
            })
        }
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| LoadError::Io {
            name: svc_name.to_string(),
            path: dir.to_path_buf(),
            source: e,
        })?;
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();
        if name.starts_with('.') {
            continue;
        }
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            names.push(name.into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Builds the variant payload for a description.
fn create_kind(desc: &ServiceDescription) -> Result<ServiceKind, LoadError> {
    Ok(match desc.service_type {
        ServiceType::Internal | ServiceType::Placeholder => ServiceKind::Internal,
        ServiceType::Triggered => ServiceKind::Triggered {
            is_triggered: false,
        },
        ServiceType::Process => {
            ServiceKind::Process(Box::new(ProcessPayload::new(process_config(desc)?)))
        }
        ServiceType::BgProcess => ServiceKind::BgProcess(Box::new(BgProcessPayload::new(
            process_config(desc)?,
            desc.pid_file.clone().unwrap_or_default(),
        ))),
        ServiceType::Scripted => {
            let mut payload =
                ScriptedPayload::new(desc.command.clone(), desc.stop_command.clone());
            payload.working_dir = desc.working_dir.clone();
            payload.run_as = resolve_run_as(desc)?;
            if desc.start_timeout > std::time::Duration::ZERO {
                payload.start_timeout = desc.start_timeout;
            }
            if desc.stop_timeout > std::time::Duration::ZERO {
                payload.stop_timeout = desc.stop_timeout;
            }
            ServiceKind::Scripted(Box::new(payload))
        }
    })
}

fn process_config(desc: &ServiceDescription) -> Result<ProcessConfig, LoadError> {
    let mut cfg = ProcessConfig {
        command: desc.command.clone(),
        stop_command: desc.stop_command.clone(),
        working_dir: desc.working_dir.clone(),
        env_file: desc.env_file.clone(),
        run_as: resolve_run_as(desc)?,
        log_type: desc.log_type,
        log_buf_max: desc.log_buf_max,
        log_file: desc.log_file.clone(),
        ..ProcessConfig::default()
    };
    if desc.start_timeout > std::time::Duration::ZERO {
        cfg.start_timeout = desc.start_timeout;
    }
    if desc.stop_timeout > std::time::Duration::ZERO {
        cfg.stop_timeout = desc.stop_timeout;
    }
    if desc.restart_delay > std::time::Duration::ZERO {
        cfg.restart_delay = desc.restart_delay;
    }
    if desc.restart_interval > std::time::Duration::ZERO {
        cfg.restart_interval = desc.restart_interval;
    }
    if desc.restart_limit_count > 0 {
        cfg.max_restart_count = desc.restart_limit_count;
    }
    Ok(cfg)
}

/// Updates variant-specific configuration during an in-place reload.
fn update_type_specific(kind: &mut ServiceKind, desc: &ServiceDescription) -> Result<(), LoadError> {
    match kind {
        ServiceKind::Process(p) => {
            let cfg = process_config(desc)?;
            p.config = cfg;
        }
        ServiceKind::BgProcess(p) => {
            let cfg = process_config(desc)?;
            p.config = cfg;
            p.pid_file = desc.pid_file.clone().unwrap_or_default();
        }
        ServiceKind::Scripted(p) => {
            p.start_command = desc.command.clone();
            p.stop_command = desc.stop_command.clone();
            p.working_dir = desc.working_dir.clone();
            p.run_as = resolve_run_as(desc)?;
            if desc.start_timeout > std::time::Duration::ZERO {
                p.start_timeout = desc.start_timeout;
            }
            if desc.stop_timeout > std::time::Duration::ZERO {
                p.stop_timeout = desc.stop_timeout;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Resolves `user` or `user:group` to numeric credentials.
fn resolve_run_as(desc: &ServiceDescription) -> Result<Option<(u32, u32)>, LoadError> {
    let Some(spec) = &desc.run_as else {
        return Ok(None);
    };

    let invalid = |message: String| LoadError::Invalid {
        name: desc.name.clone(),
        message,
    };

    let (user_part, group_part) = match spec.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (spec.as_str(), None),
    };

    let user = nix::unistd::User::from_name(user_part)
        .map_err(|e| invalid(format!("looking up user '{user_part}': {e}")))?
        .ok_or_else(|| invalid(format!("unknown user '{user_part}'")))?;

    let gid = match group_part {
        Some(g) => {
            nix::unistd::Group::from_name(g)
                .map_err(|e| invalid(format!("looking up group '{g}': {e}")))?
                .ok_or_else(|| invalid(format!("unknown group '{g}'")))?
                .gid
                .as_raw()
        }
        None => user.gid.as_raw(),
    };

    Ok(Some((user.uid.as_raw(), gid)))
}
