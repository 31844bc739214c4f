//! Shell commands run on managed hosts
//!
//! Builders only; nothing here talks to a host.

use crate::kubeadm::version::KubeVersion;
use crate::ssh::shell_quote;

/// Kubernetes configuration directory on every host
pub const KUBE_DIR: &str = "/etc/kubernetes";

/// Docker per-registry certificate directory
pub const DOCKER_CERT_DIR: &str = "/etc/docker/certs.d";

/// Bootstrap configuration written to Master0
pub const INIT_CONFIG: &str = "etc/kubeadm-config.yaml";

/// Per-host join configuration
pub const JOIN_CONFIG: &str = "etc/kubeadm-join-config.yaml";

/// Teardown script accumulated under the rootfs
pub const CLEAN_SCRIPT: &str = "clean.sh";

/// Virtual-IP load balancer static pod
pub const LVSCARE_MANIFEST: &str = "/etc/kubernetes/manifests/kube-lvscare.yaml";

/// Marker left by a finished kubeadm init
pub const INIT_MARKER: &str = "/etc/kubernetes/manifests/kube-apiserver.yaml";

/// Marker left by a finished kubeadm join
pub const KUBELET_CONF: &str = "/etc/kubernetes/kubelet.conf";

const INIT_PREFLIGHT: &str = "SystemVerification,Port-10250,DirAvailable--etc-kubernetes-manifests";
const NODE_PREFLIGHT: &str = "Port-10250,DirAvailable--etc-kubernetes-manifests";

/// Add `ip domain` to /etc/hosts unless already present
pub fn add_etc_hosts(ip: &str, domain: &str) -> String {
    let line = format!("{} {}", ip, domain);
    format!(
        "cat /etc/hosts |grep '{}' || echo '{}' >> /etc/hosts",
        line, line
    )
}

/// Replace a hosts entry in place
pub fn update_etc_hosts(old: &str, new: &str) -> String {
    format!(
        r#"sed "s/{}/{}/g" < /etc/hosts > hosts && cp -f hosts /etc/hosts"#,
        old, new
    )
}

/// Drop every hosts entry mentioning `domain`
pub fn remove_etc_hosts(domain: &str) -> String {
    format!(r#"sed -i "/{}/d" /etc/hosts"#, domain)
}

/// Prefix `command` with exported `KEY=value` pairs; malformed entries are
/// skipped
pub fn with_env(env: &[String], command: &str) -> String {
    let exports: Vec<String> = env
        .iter()
        .filter_map(|e| e.split_once('='))
        .filter(|(k, _)| !k.is_empty())
        .map(|(k, v)| format!("{}={}", k, shell_quote(v)))
        .collect();
    if exports.is_empty() {
        return command.to_string();
    }
    format!("export {} && {}", exports.join(" "), command)
}

/// Write `content` to `path`, creating the parent directory
pub fn write_file(path: &str, content: &str) -> String {
    format!(
        "mkdir -p $(dirname {path}) && cat > {path} <<'CLUSTERFORGE_EOF'\n{content}\nCLUSTERFORGE_EOF",
        path = path,
        content = content.trim_end_matches('\n')
    )
}

/// Register a teardown line in the rootfs clean-up script
pub fn register_clean(rootfs: &str, line: &str) -> String {
    let script = format!("{}/{}", rootfs, CLEAN_SCRIPT);
    format!(
        "touch {script} && (grep -qxF '{line}' {script} || echo '{line}' >> {script})",
        script = script,
        line = line.replace('\'', "")
    )
}

/// Run the clean-up script when present
pub fn run_clean_script(rootfs: &str) -> String {
    format!(
        "if [ -f {rootfs}/{script} ]; then bash {rootfs}/{script}; fi",
        rootfs = rootfs,
        script = CLEAN_SCRIPT
    )
}

/// Install the admin kubeconfig for root
pub fn copy_kubeconfig() -> String {
    "rm -rf .kube/config && mkdir -p /root/.kube && cp /etc/kubernetes/admin.conf /root/.kube/config"
        .to_string()
}

/// Point the scheduler and controller-manager kubeconfigs at the local
/// apiserver; needed on v1.19.1 and v1.19.2
pub fn replace_kubeconfig_server(domain: &str, ip: &str) -> String {
    format!(
        "sed -i 's/{domain}/{ip}/' {dir}/scheduler.conf && sed -i 's/{domain}/{ip}/' {dir}/controller-manager.conf",
        domain = domain,
        ip = ip,
        dir = KUBE_DIR
    )
}

/// Copy the audit policy and other static assets into place
pub fn copy_static_files(rootfs: &str) -> String {
    format!(
        "mkdir -p {dir} && if [ -d {rootfs}/statics ]; then cp -rf {rootfs}/statics/* {dir}/; fi",
        dir = KUBE_DIR,
        rootfs = rootfs
    )
}

fn verbosity(debug: bool) -> u8 {
    if debug {
        6
    } else {
        0
    }
}

/// `kubeadm init` against the generated bootstrap configuration
pub fn kubeadm_init(rootfs: &str, version: &KubeVersion, debug: bool) -> String {
    let upload = if version.at_least(1, 15, 0) {
        "--upload-certs"
    } else {
        "--experimental-upload-certs"
    };
    format!(
        "kubeadm init --config={}/{} {} -v {} --ignore-preflight-errors={}",
        rootfs,
        INIT_CONFIG,
        upload,
        verbosity(debug),
        INIT_PREFLIGHT
    )
}

/// Credentials a joining host needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinFlags<'a> {
    pub endpoint: &'a str,
    pub token: &'a str,
    pub ca_hash: &'a str,
    pub certificate_key: &'a str,
}

/// `kubeadm join` for a master or a node
pub fn kubeadm_join(
    rootfs: &str,
    version: &KubeVersion,
    master: bool,
    flags: &JoinFlags<'_>,
    debug: bool,
) -> String {
    let preflight = if master { INIT_PREFLIGHT } else { NODE_PREFLIGHT };
    let base = if version.at_least(1, 15, 0) {
        format!("kubeadm join --config={}/{}", rootfs, JOIN_CONFIG)
    } else if master {
        format!(
            "kubeadm join {} --token {} --discovery-token-ca-cert-hash {} --experimental-control-plane --certificate-key {}",
            flags.endpoint, flags.token, flags.ca_hash, flags.certificate_key
        )
    } else {
        format!(
            "kubeadm join {} --token {} --discovery-token-ca-cert-hash {}",
            flags.endpoint, flags.token, flags.ca_hash
        )
    };
    format!(
        "{} -v {} --ignore-preflight-errors={}",
        base,
        verbosity(debug),
        preflight
    )
}

/// Re-upload control-plane certificates and print the certificate key
pub fn upload_certs(version: &KubeVersion, debug: bool) -> String {
    let flag = if version.at_least(1, 15, 0) {
        "--upload-certs"
    } else {
        "--experimental-upload-certs"
    };
    format!(
        "kubeadm init phase upload-certs {} -v {}",
        flag,
        verbosity(debug)
    )
}

/// Create a join token and print the full join command
pub fn create_join_token(debug: bool) -> String {
    format!(
        "kubeadm token create --print-join-command -v {}",
        verbosity(debug)
    )
}

/// Reset kubeadm state and remove kubernetes files
pub fn clean_host(debug: bool) -> String {
    format!(
        "systemctl restart docker kubelet; if which kubeadm > /dev/null 2>&1; then kubeadm reset -f -v {}; fi && \
         (modprobe -r ipip || true) && lsmod > /dev/null && \
         rm -rf /etc/kubernetes/ && rm -rf /etc/systemd/system/kubelet.service.d && \
         rm -rf /etc/systemd/system/kubelet.service && rm -rf /usr/bin/kubeadm && \
         rm -rf /usr/bin/kubelet-pre-start.sh && rm -rf /usr/bin/kubelet && rm -rf /usr/bin/crictl && \
         rm -rf /etc/cni && rm -rf /opt/cni && rm -rf /var/lib/etcd && rm -rf /var/etcd",
        verbosity(debug)
    )
}

/// Remove the kubectl binaries and root kubeconfig
pub fn remove_kubeconfig() -> String {
    "rm -rf /usr/bin/kube* && rm -rf ~/.kube/".to_string()
}

/// Remove registry certificates for `domain`
pub fn remove_registry_certs(domain: &str) -> String {
    format!("rm -rf {}/{}*", DOCKER_CERT_DIR, domain)
}

/// Remove the virtual-IP static pod
pub fn remove_lvscare() -> String {
    format!("rm -rf {}", LVSCARE_MANIFEST)
}

/// Delete a node object through the API
pub fn delete_node(name: &str) -> String {
    format!("kubectl delete node {}", name)
}

/// List node names known to the API
pub fn list_node_names() -> String {
    "kubectl get nodes | grep -v NAME | awk '{print $1}'".to_string()
}

/// One-shot IPVS rule so a fresh node reaches the control plane before
/// its load-balancer pod runs
pub fn add_ipvs(vip: &str, masters: &[String]) -> String {
    let rs: Vec<String> = masters.iter().map(|m| format!("--rs {}:6443", m)).collect();
    format!(
        "seautil ipvs --vs {}:6443 {} --health-path /healthz --health-schem https --run-once",
        vip,
        rs.join(" ")
    )
}

/// Delete a route added for the virtual IP
pub fn delete_route(vip: &str, gateway: &str) -> String {
    format!(
        "if command -v seautil > /dev/null 2>&1; then seautil route del --host {} --gateway {}; fi",
        vip, gateway
    )
}

/// Drain a node ahead of an upgrade
pub fn drain(node: &str) -> String {
    format!(
        "kubectl drain {} --ignore-daemonsets --delete-local-data --force",
        node
    )
}

pub fn uncordon(node: &str) -> String {
    format!("kubectl uncordon {}", node)
}

/// Replace kubernetes binaries from the rootfs
pub fn install_binaries(rootfs: &str) -> String {
    format!(
        "if [ -d {rootfs}/bin ]; then cp -rf {rootfs}/bin/* /usr/bin/; fi",
        rootfs = rootfs
    )
}

pub fn upgrade_apply(version: &str) -> String {
    format!("kubeadm upgrade apply {} -y", version)
}

pub fn upgrade_node() -> String {
    "kubeadm upgrade node".to_string()
}

pub fn restart_kubelet() -> String {
    "systemctl daemon-reload && systemctl restart kubelet".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_etc_hosts_is_guarded() {
        assert_eq!(
            add_etc_hosts("10.0.0.1", "apiserver.cluster.local"),
            "cat /etc/hosts |grep '10.0.0.1 apiserver.cluster.local' || echo '10.0.0.1 apiserver.cluster.local' >> /etc/hosts"
        );
    }

    #[test]
    fn test_init_flag_by_version() {
        let new = KubeVersion::parse("v1.19.8").unwrap();
        let old = KubeVersion::parse("v1.14.1").unwrap();
        assert!(kubeadm_init("/r", &new, false).contains("--upload-certs -v 0"));
        assert!(kubeadm_init("/r", &old, true).contains("--experimental-upload-certs -v 6"));
    }

    #[test]
    fn test_join_forms() {
        let flags = JoinFlags {
            endpoint: "10.0.0.1:6443",
            token: "abc.def",
            ca_hash: "sha256:00",
            certificate_key: "k",
        };
        let new = KubeVersion::parse("v1.20.0").unwrap();
        let old = KubeVersion::parse("v1.14.0").unwrap();

        let cmd = kubeadm_join("/r", &new, false, &flags, false);
        assert!(cmd.starts_with("kubeadm join --config=/r/etc/kubeadm-join-config.yaml"));
        assert!(cmd.ends_with("--ignore-preflight-errors=Port-10250,DirAvailable--etc-kubernetes-manifests"));

        let cmd = kubeadm_join("/r", &old, true, &flags, false);
        assert!(cmd.contains("--token abc.def --discovery-token-ca-cert-hash sha256:00 --experimental-control-plane --certificate-key k"));
    }

    #[test]
    fn test_with_env() {
        let env = vec!["POD_CIDR=100.64.0.0/10".to_string(), "bogus".to_string(), "MSG=it's".to_string()];
        assert_eq!(
            with_env(&env, "bash init.sh"),
            r#"export POD_CIDR='100.64.0.0/10' MSG='it'\''s' && bash init.sh"#
        );
        assert_eq!(with_env(&[], "bash init.sh"), "bash init.sh");
    }

    #[test]
    fn test_write_file_heredoc() {
        let cmd = write_file("/etc/a/b.yaml", "x: 1\n");
        assert_eq!(
            cmd,
            "mkdir -p $(dirname /etc/a/b.yaml) && cat > /etc/a/b.yaml <<'CLUSTERFORGE_EOF'\nx: 1\nCLUSTERFORGE_EOF"
        );
    }
}
