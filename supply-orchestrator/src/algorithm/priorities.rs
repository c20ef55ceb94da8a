use super::{AlgorithmError, Host, Selector};

type Score = Box<dyn Fn(&Selector, &[Host]) -> Result<Vec<f64>, AlgorithmError> + Send + Sync>;

/// Named, weighted host scorer. `score` returns one value per host, already weighted.
pub struct Priority {
    pub name: &'static str,
    pub weight: f64,
    pub score: Score,
}

/// Balanced cpu/memory usage after placing the request.
///
/// A host that the request saturates on both resources scores the maximum, which packs
/// saturating requests instead of spreading them. Saturating only one resource scores 0.
pub fn balanced_resource_allocation(weight: f64) -> Priority {
    Priority {
        name: "balanced_resource_allocation",
        weight,
        score: Box::new(move |sel, hosts| {
            hosts
                .iter()
                .map(|h| {
                    if h.total_cores == 0 || h.total_mem_gb == 0 {
                        return Err(AlgorithmError::PriorityFailed {
                            name: "balanced_resource_allocation".to_string(),
                            reason: format!("host {} reports no capacity", h.ip),
                        });
                    }
                    let cpu = (sel.cores + h.used_cores) as f64 / h.total_cores as f64;
                    let mem = (sel.mem_gb + h.used_mem_gb) as f64 / h.total_mem_gb as f64;
                    Ok(balance(cpu, mem) * weight)
                })
                .collect()
        }),
    }
}

pub fn balance(cpu: f64, mem: f64) -> f64 {
    match (cpu >= 1.0, mem >= 1.0) {
        (true, true) => 1.0,
        (true, false) | (false, true) => 0.0,
        (false, false) => 1.0 - (cpu - mem).abs(),
    }
}

/// Run every priority on its own thread and sum per host. The first error wins.
pub fn run_all(
    priorities: &[Priority],
    selector: &Selector,
    hosts: &[Host],
) -> Result<Vec<f64>, AlgorithmError> {
    let results: Vec<Result<Vec<f64>, AlgorithmError>> = std::thread::scope(|scope| {
        let handles: Vec<_> = priorities
            .iter()
            .map(|p| (p.name, scope.spawn(move || (p.score)(selector, hosts))))
            .collect();
        handles
            .into_iter()
            .map(|(name, h)| {
                h.join().unwrap_or_else(|_| {
                    Err(AlgorithmError::PriorityFailed {
                        name: name.to_string(),
                        reason: "scorer panicked".to_string(),
                    })
                })
            })
            .collect()
    });

    let mut total = vec![0.0; hosts.len()];
    for (p, res) in priorities.iter().zip(results) {
        let scores = res?;
        if scores.len() != hosts.len() {
            return Err(AlgorithmError::PriorityFailed {
                name: p.name.to_string(),
                reason: format!("{} scores for {} hosts", scores.len(), hosts.len()),
            });
        }
        for (t, s) in total.iter_mut().zip(scores) {
            *t += s;
        }
    }
    Ok(total)
}
