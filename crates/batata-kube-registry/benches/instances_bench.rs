// Benchmarks for instance resolution
// Measures port lookups, proxy resolution and network classification on a populated registry

use std::hint::black_box;
use std::sync::Arc;

use batata_kube_registry::{
    Controller, ControllerOptions, EndpointAddress, EndpointPort, EndpointSubset, KubeEndpoints,
    KubePod, KubeService, KubeServicePort, MeshNetworks, NetworkConfig, NetworkEndpointSource,
    PodPhase, Resource, ResourceKind, TargetPort, WatchEvent,
};
use batata_mesh::{Labels, LabelsCollection, Proxy, PushBridge};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

fn app_labels(app: &str) -> Labels {
    [("app".to_string(), app.to_string())].into()
}

/// Registry with `services` services of `pods` pods each
fn populated(rt: &tokio::runtime::Runtime, services: usize, pods: usize) -> Controller {
    let controller = Controller::new(ControllerOptions::default(), Arc::new(PushBridge::default()));
    for kind in ResourceKind::ALL {
        controller.on_watch_event(WatchEvent::Synced(kind));
    }

    for s in 0..services {
        let name = format!("svc-{}", s);
        controller.on_watch_event(WatchEvent::Applied(Resource::Service(KubeService {
            cluster_ip: Some(format!("10.96.{}.{}", s / 250, s % 250 + 1)),
            selector: app_labels(&name),
            ports: vec![KubeServicePort::new("http", 8080, TargetPort::Number(9376))],
            ..KubeService::new(name.clone(), "bench")
        })));

        let mut addresses = Vec::with_capacity(pods);
        for p in 0..pods {
            let ip = format!("10.{}.{}.{}", s / 250, s % 250, p + 1);
            let pod_name = format!("{}-{}", name, p);
            controller.on_watch_event(WatchEvent::Applied(Resource::Pod(KubePod {
                pod_ip: ip.clone(),
                phase: PodPhase::Running,
                labels: app_labels(&name),
                ..KubePod::new(pod_name.clone(), "bench")
            })));
            addresses.push(EndpointAddress::for_pod(ip, &pod_name, "bench"));
        }

        controller.on_watch_event(WatchEvent::Applied(Resource::Endpoints(KubeEndpoints {
            subsets: vec![EndpointSubset {
                addresses,
                ports: vec![EndpointPort::new("http", 9376)],
                ..Default::default()
            }],
            ..KubeEndpoints::new(name, "bench")
        })));
    }

    rt.block_on(controller.flush());
    controller
}

fn bench_instances_by_port(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("instances_by_port");

    for pods in [10, 100, 1000] {
        let controller = populated(&rt, 10, pods);
        let svc = controller.get_service("svc-0.bench.svc.cluster.local").unwrap();
        let filter = LabelsCollection::from(app_labels("svc-0"));

        group.bench_with_input(BenchmarkId::from_parameter(pods), &pods, |b, _| {
            b.iter(|| controller.instances_by_port(black_box(&svc), black_box(8080), &filter))
        });
    }

    group.finish();
}

fn bench_proxy_service_instances(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let controller = populated(&rt, 100, 10);

    let pod_proxy = Proxy {
        id: "sidecar~10.0.5.1".to_string(),
        ip_addresses: vec!["10.0.5.1".to_string()],
        config_namespace: "bench".to_string(),
        ..Default::default()
    };
    c.bench_function("proxy_instances_pod_lookup", |b| {
        b.iter(|| controller.get_proxy_service_instances(black_box(&pod_proxy)))
    });

    let unknown_proxy = Proxy {
        id: "sidecar~192.168.0.1".to_string(),
        ip_addresses: vec!["192.168.0.1".to_string()],
        config_namespace: "bench".to_string(),
        ..Default::default()
    };
    c.bench_function("proxy_instances_endpoint_scan", |b| {
        b.iter(|| controller.get_proxy_service_instances(black_box(&unknown_proxy)))
    });
}

fn bench_resolve_network(c: &mut Criterion) {
    let controller = Controller::new(ControllerOptions::default(), Arc::new(PushBridge::default()));
    let networks = MeshNetworks {
        networks: (0..64)
            .map(|i| NetworkConfig {
                name: format!("net-{}", i),
                endpoints: vec![NetworkEndpointSource::cidr(format!("10.{}.0.0/16", i))],
            })
            .collect(),
    };
    controller.init_network_lookup(&networks);

    c.bench_function("resolve_network_cidr", |b| {
        b.iter(|| controller.resolve_network(black_box("10.42.7.9")))
    });
}

criterion_group!(
    benches,
    bench_instances_by_port,
    bench_proxy_service_instances,
    bench_resolve_network
);
criterion_main!(benches);
