//! 命令预处理与 apt 输出降噪

/// 镜像已具备，直接跳过的命令前缀
const SKIP_PREFIXES: &[&str] = &[
    "apt-get update",
    "apt-get install",
    "pip install decimal",
    "pip3 install decimal",
];

const APT_NOISE_PREFIXES: &[&str] = &[
    "Reading package",
    "Building dependency",
    "Get:",
    "Fetched",
    "Selecting previously",
    "Preparing to unpack",
    "Unpacking",
    "Setting up",
    "Processing triggers",
    "(Reading database",
    "Adding 'diversion",
    "Preconfiguring",
    "Need to get",
    "After this operation",
    "The following",
    "Suggested packages",
    "update-alternatives",
    "done.",
    "Running hooks",
    "Updating certificates",
    "0 added",
    "146 added",
    "Current default",
    "Local time",
    "Universal Time",
    "Run 'dpkg",
    "Hit:",
    "Ign:",
];

/// 包列表刷屏行
const PACKAGE_LIST_PREFIXES: &[&str] = &["libc", "lib", "python3-", "adduser", "binutils"];

/// critic 阶段视为安装噪音、不当作错误的 stderr 片段
const INSTALL_NOISE: &[&str] = &[
    "Reading package",
    "Building dependency",
    "Get:",
    "Fetched",
    "Selecting previously",
    "Preparing to unpack",
    "Unpacking",
    "Setting up",
    "Processing triggers",
    "(Reading database",
];

const BREAK_SYSTEM_PACKAGES: &str = "--break-system-packages";

/// 过滤后的命令列表
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandPlan {
    pub run: Vec<String>,
    pub skipped: Vec<String>,
}

/// 去掉镜像里已有的安装命令；pip install 自动补 --break-system-packages
pub fn filter_commands(commands: &[String]) -> CommandPlan {
    let mut plan = CommandPlan::default();
    for cmd in commands {
        let cmd = cmd.trim();
        if cmd.is_empty() {
            continue;
        }
        if SKIP_PREFIXES.iter().any(|p| cmd.starts_with(p)) {
            plan.skipped.push(cmd.to_string());
            continue;
        }
        let is_pip = cmd.contains("pip install") || cmd.contains("pip3 install");
        if is_pip && !cmd.contains(BREAK_SYSTEM_PACKAGES) {
            plan.run.push(format!("{cmd} {BREAK_SYSTEM_PACKAGES}"));
        } else {
            plan.run.push(cmd.to_string());
        }
    }
    plan
}

/// 去掉 apt 的进度与包列表行；全部被过滤时返回 None
pub fn filter_apt_noise(text: &str) -> Option<String> {
    let kept: Vec<&str> = text
        .split('\n')
        .filter(|line| {
            let l = line.trim();
            !l.is_empty()
                && !APT_NOISE_PREFIXES.iter().any(|p| l.starts_with(p))
                && !PACKAGE_LIST_PREFIXES.iter().any(|p| l.starts_with(p))
        })
        .collect();
    let joined = kept.join("\n");
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn is_install_noise(content: &str) -> bool {
    INSTALL_NOISE.iter().any(|n| content.contains(n))
}
