use std::collections::{HashMap, HashSet};

use super::apps::AllowedApp;
use super::process::ProcessInfo;

/// Why a process was left running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowReason {
    SystemProcess,
    AllowedApp,
    ChildOfSystemProcess,
    ReservedPid,
    OwnProcess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow(AllowReason),
    Block,
}

/// Allow-list evaluation for one sweep.
///
/// Names compare case-insensitively. Built fresh from the current allowed
/// apps so that list updates take effect on the next sweep.
#[derive(Debug, Clone)]
pub struct AllowList {
    system: HashSet<String>,
    /// System processes whose children get no exemption
    shells: HashSet<String>,
    apps: HashSet<String>,
    reserved_pid_threshold: u32,
    exempt_system_children: bool,
    own_pid: u32,
}

impl AllowList {
    pub fn new(
        system_processes: &[String],
        shell_processes: &[String],
        apps: &[AllowedApp],
        reserved_pid_threshold: u32,
        exempt_system_children: bool,
        own_pid: u32,
    ) -> Self {
        Self {
            system: system_processes.iter().map(|n| n.to_lowercase()).collect(),
            shells: shell_processes.iter().map(|n| n.to_lowercase()).collect(),
            apps: apps.iter().flat_map(AllowedApp::process_names).collect(),
            reserved_pid_threshold,
            exempt_system_children,
            own_pid,
        }
    }

    pub fn judge(&self, process: &ProcessInfo, parent_name: Option<&str>) -> Verdict {
        let name = process.name.to_lowercase();

        if process.pid == self.own_pid {
            Verdict::Allow(AllowReason::OwnProcess)
        } else if process.pid < self.reserved_pid_threshold {
            Verdict::Allow(AllowReason::ReservedPid)
        } else if self.system.contains(&name) {
            Verdict::Allow(AllowReason::SystemProcess)
        } else if self.apps.contains(&name) {
            Verdict::Allow(AllowReason::AllowedApp)
        } else if self.exempt_system_children
            && parent_name.is_some_and(|parent| {
                let parent = parent.to_lowercase();
                self.system.contains(&parent) && !self.shells.contains(&parent)
            })
        {
            Verdict::Allow(AllowReason::ChildOfSystemProcess)
        } else {
            Verdict::Block
        }
    }

    /// Judge a whole process table snapshot, resolving parent names from it
    pub fn judge_all<'a>(
        &'a self,
        processes: &'a [ProcessInfo],
    ) -> impl Iterator<Item = (&'a ProcessInfo, Verdict)> + 'a {
        let names: HashMap<u32, &'a str> = processes
            .iter()
            .map(|p| (p.pid, p.name.as_str()))
            .collect();

        processes.iter().map(move |process| {
            let parent = process.parent_pid.and_then(|pid| names.get(&pid).copied());
            (process, self.judge(process, parent))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proc(pid: u32, parent: Option<u32>, name: &str) -> ProcessInfo {
        ProcessInfo {
            pid,
            parent_pid: parent,
            name: name.to_string(),
            exe: None,
        }
    }

    fn allow_list(exempt_children: bool) -> AllowList {
        AllowList::new(
            &[
                "svchost.exe".to_string(),
                "winlogon.exe".to_string(),
                "explorer.exe".to_string(),
            ],
            &["explorer.exe".to_string()],
            &[AllowedApp::new("chrome.exe", r"C:\Chrome\chrome.exe")],
            8,
            exempt_children,
            4242,
        )
    }

    #[test]
    fn test_each_allow_rule() {
        let list = allow_list(true);

        assert_eq!(
            list.judge(&proc(4242, None, "kiosk-agent.exe"), None),
            Verdict::Allow(AllowReason::OwnProcess)
        );
        assert_eq!(
            list.judge(&proc(4, None, "System"), None),
            Verdict::Allow(AllowReason::ReservedPid)
        );
        assert_eq!(
            list.judge(&proc(900, None, "SVCHOST.EXE"), None),
            Verdict::Allow(AllowReason::SystemProcess)
        );
        assert_eq!(
            list.judge(&proc(901, None, "Chrome.exe"), None),
            Verdict::Allow(AllowReason::AllowedApp)
        );
        assert_eq!(
            list.judge(&proc(902, Some(900), "consent.exe"), Some("svchost.exe")),
            Verdict::Allow(AllowReason::ChildOfSystemProcess)
        );
        assert_eq!(list.judge(&proc(903, None, "cmd.exe"), None), Verdict::Block);
    }

    #[test]
    fn test_shell_children_are_not_exempt() {
        let list = allow_list(true);
        assert_eq!(
            list.judge(&proc(910, None, "Explorer.EXE"), None),
            Verdict::Allow(AllowReason::SystemProcess)
        );
        assert_eq!(
            list.judge(&proc(911, Some(910), "cmd.exe"), Some("Explorer.EXE")),
            Verdict::Block
        );
        assert_eq!(
            list.judge(&proc(912, Some(910), "chrome.exe"), Some("explorer.exe")),
            Verdict::Allow(AllowReason::AllowedApp)
        );
    }

    #[test]
    fn test_child_exemption_can_be_disabled() {
        let list = allow_list(false);
        assert_eq!(
            list.judge(&proc(902, Some(900), "consent.exe"), Some("svchost.exe")),
            Verdict::Block
        );
    }

    #[test]
    fn test_judge_all_resolves_parents_from_snapshot() {
        let list = allow_list(true);
        let table = vec![
            proc(900, None, "svchost.exe"),
            proc(950, Some(900), "helper.exe"),
            proc(960, Some(1234), "cmd.exe"),
        ];

        let blocked: Vec<u32> = list
            .judge_all(&table)
            .filter(|(_, verdict)| *verdict == Verdict::Block)
            .map(|(p, _)| p.pid)
            .collect();

        assert_eq!(blocked, vec![960]);
    }
}
