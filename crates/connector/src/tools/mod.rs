// BSD 3-Clause License
// Copyright (c) 2026, Virtual Cable S.L.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice,
//    this list of conditions and the following disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice,
//    this list of conditions and the following disclaimer in the documentation
//    and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors
//    may be used to endorse or promote products derived from this software
//    without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS"
// AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
// IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE
// FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
// DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER
// CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY,
// OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

// Authors: Adolfo Gómez, dkmaster at dkmon dot com
use std::{path::PathBuf, sync::Mutex, time::Duration};

use rand::Rng;

use shared::log;

use crate::consts::{EARLY_UNLINK_GRACE_SECS, END_SCRIPT_DELAY_SECS, LATE_UNLINK_GRACE_SECS};

/// Something the session must wait for before cleaning up: a spawned
/// in-process task or an external client process.
pub enum Waitable {
    Task(tokio::task::JoinHandle<()>),
    Process(tokio::process::Child),
}

/// Deferred cleanup state for one session: files to unlink, things to wait
/// for and callables to run right before the session finishes. Passed
/// explicitly to whoever needs to register work; all mutation is serialized.
#[derive(Default)]
pub struct CleanupRegistry {
    unlink_files: Mutex<Vec<(PathBuf, bool)>>,
    tasks: Mutex<Vec<(Waitable, bool)>>,
    before_exit: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_for_delayed_deletion(&self, path: PathBuf, early: bool) {
        log::debug!(
            "Added file {} to unlink on {} stage",
            path.display(),
            if early { "early" } else { "later" }
        );
        if let Ok(mut files) = self.unlink_files.lock() {
            files.push((path, early));
        }
    }

    pub fn add_task_to_wait(&self, task: Waitable, wait_subprocesses: bool) {
        log::debug!(
            "Added task to wait{}",
            if wait_subprocesses {
                " (with subprocesses)"
            } else {
                ""
            }
        );
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push((task, wait_subprocesses));
        }
    }

    pub fn register_execute_before_exit(&self, callable: Box<dyn FnOnce() + Send>) {
        log::debug!("Added exec before exit");
        if let Ok(mut callables) = self.before_exit.lock() {
            callables.push(callable);
        }
    }

    /// Removes the registered files for one stage, after a grace pause so
    /// whoever still holds them can let go.
    pub async fn unlink_files(&self, early: bool) {
        let files: Vec<PathBuf> = self
            .unlink_files
            .lock()
            .map(|mut files| {
                let (matching, rest): (Vec<_>, Vec<_>) =
                    files.drain(..).partition(|(_, stage)| *stage == early);
                *files = rest;
                matching.into_iter().map(|(path, _)| path).collect()
            })
            .unwrap_or_default();
        if files.is_empty() {
            return;
        }
        log::debug!(
            "Unlinking files on {} stage: {:?}",
            if early { "early" } else { "later" },
            files
        );
        let grace = if early {
            EARLY_UNLINK_GRACE_SECS
        } else {
            LATE_UNLINK_GRACE_SECS
        };
        tokio::time::sleep(Duration::from_secs(grace)).await;
        for path in files {
            if let Err(e) = std::fs::remove_file(&path) {
                log::debug!("File {} not deleted: {}", path.display(), e);
            }
        }
    }

    /// Joins every registered task, in registration order. For processes
    /// flagged with `wait_subprocesses`, also waits for the processes they
    /// spawned themselves.
    pub async fn wait_for_tasks(&self) {
        let tasks: Vec<(Waitable, bool)> = self
            .tasks
            .lock()
            .map(|mut tasks| tasks.drain(..).collect())
            .unwrap_or_default();
        log::debug!("Started to wait for {} tasks", tasks.len());
        for (task, wait_subprocesses) in tasks {
            match task {
                Waitable::Task(handle) => {
                    if let Err(e) = handle.await {
                        log::error!("Waiting for task to finish error: {}", e);
                    }
                }
                Waitable::Process(mut child) => {
                    let pid = child.id();
                    if let Err(e) = child.wait().await {
                        log::error!("Waiting for process to finish error: {}", e);
                    }
                    if wait_subprocesses && let Some(pid) = pid {
                        wait_for_children(pid).await;
                    }
                }
            }
        }
    }

    /// Runs the before-exit callables in registration order.
    pub fn exec_before_exit(&self) {
        let callables: Vec<Box<dyn FnOnce() + Send>> = self
            .before_exit
            .lock()
            .map(|mut callables| callables.drain(..).collect())
            .unwrap_or_default();
        log::debug!("Executing {} exec before exit", callables.len());
        for callable in callables {
            callable();
        }
    }
}

/// Stores content under a random name in the temp directory. The returned
/// path is meant to be registered for delayed deletion.
pub fn save_temp_file(content: &str, extension: &str) -> std::io::Result<PathBuf> {
    let name: String = rand::rng()
        .sample_iter(rand::distr::Alphanumeric)
        .take(16)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    let extension = if extension.is_empty() {
        ".uds".to_string()
    } else if extension.starts_with('.') {
        extension.to_string()
    } else {
        format!(".{}", extension)
    };
    let path = std::env::temp_dir().join(format!("{}{}", name, extension));
    std::fs::write(&path, content)?;
    log::debug!("Saved temp file {}", path.display());
    Ok(path)
}

#[cfg(target_os = "linux")]
fn child_pids(parent: u32) -> Vec<u32> {
    let mut children = Vec::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return children;
    };
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
            continue;
        };
        // The comm field may contain anything, fields start after the ')'
        if let Some(end) = stat.rfind(')') {
            let mut fields = stat[end + 1..].split_whitespace();
            let ppid = fields.nth(1).and_then(|f| f.parse::<u32>().ok());
            if ppid == Some(parent) {
                children.push(pid);
            }
        }
    }
    children
}

#[cfg(target_os = "linux")]
async fn wait_for_children(parent: u32) {
    loop {
        let children = child_pids(parent);
        if children.is_empty() {
            break;
        }
        log::debug!("Waiting for subprocesses... {} {:?}", parent, children);
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

#[cfg(not(target_os = "linux"))]
async fn wait_for_children(parent: u32) {
    log::debug!("Subprocess waiting not available here (parent {})", parent);
}

/// Post session shutdown sequence. Errors inside are best effort and only
/// logged; nothing here may take the session down.
pub async fn end_script(registry: &CleanupRegistry) {
    // Let the transport client settle before touching anything
    tokio::time::sleep(Duration::from_secs(END_SCRIPT_DELAY_SECS)).await;
    registry.unlink_files(true).await;
    log::debug!("Waiting for tasks to finish...");
    registry.wait_for_tasks().await;
    registry.unlink_files(false).await;
    log::debug!("Executing tasks before exit");
    registry.exec_before_exit();
    log::debug!("endScript done");
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[test]
    fn test_save_temp_file_roundtrip() {
        let path = save_temp_file("some content", "").unwrap();
        assert!(path.extension().is_some_and(|e| e == "uds"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "some content");
        std::fs::remove_file(path).ok();

        let path = save_temp_file("x", "rdp").unwrap();
        assert!(path.extension().is_some_and(|e| e == "rdp"));
        std::fs::remove_file(path).ok();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlink_files_respects_stages() {
        let registry = CleanupRegistry::new();
        let early = save_temp_file("early", "").unwrap();
        let late = save_temp_file("late", "").unwrap();
        registry.register_for_delayed_deletion(early.clone(), true);
        registry.register_for_delayed_deletion(late.clone(), false);

        registry.unlink_files(true).await;
        assert!(!early.exists());
        assert!(late.exists());

        registry.unlink_files(false).await;
        assert!(!late.exists());
    }

    #[tokio::test]
    async fn test_wait_for_tasks_joins_in_order() {
        let registry = CleanupRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for index in 0..3usize {
            let order = order.clone();
            registry.add_task_to_wait(
                Waitable::Task(tokio::spawn(async move {
                    order.lock().unwrap().push(index);
                })),
                false,
            );
        }
        registry.wait_for_tasks().await;
        assert_eq!(order.lock().unwrap().len(), 3);
        // Second call is a no-op, the list was drained
        registry.wait_for_tasks().await;
    }

    #[tokio::test]
    async fn test_before_exit_runs_in_registration_order() {
        let registry = CleanupRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        for index in 0..3usize {
            let counter = counter.clone();
            let seen = seen.clone();
            registry.register_execute_before_exit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                seen.lock().unwrap().push(index);
            }));
        }
        registry.exec_before_exit();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
        // Drained: running again does nothing
        registry.exec_before_exit();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_script_full_sequence() {
        let registry = CleanupRegistry::new();
        let file = save_temp_file("bye", "").unwrap();
        registry.register_for_delayed_deletion(file.clone(), true);
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = ran.clone();
            registry.register_execute_before_exit(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        end_script(&registry).await;
        assert!(!file.exists());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
